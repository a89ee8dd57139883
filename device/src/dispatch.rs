use std::fmt::Write;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::net::Sender;
use crate::ota::{UpdateJob, UpdateSimulator};
use crate::protocol::{decode_header, UpdateRequest};
use crate::types::{ConfigUpdate, SharedSession};
use crate::variant::{Inbound, Protocol};

pub struct CommandDispatcher {
    protocol: Arc<dyn Protocol>,
    session: SharedSession,
    sender: Sender,
    updates: Arc<UpdateSimulator>,
}

impl CommandDispatcher {
    pub fn new(
        protocol: Arc<dyn Protocol>,
        session: SharedSession,
        sender: Sender,
        updates: Arc<UpdateSimulator>,
    ) -> Self {
        Self {
            protocol,
            session,
            sender,
            updates,
        }
    }

    /// Decodes the header and acts on the command. Errors are per-datagram;
    /// the caller logs them and keeps receiving.
    pub async fn dispatch(&self, datagram: &[u8]) -> Result<Inbound> {
        debug!(packet = %hex(datagram), "Received packet");
        let (header, payload) = decode_header(datagram)?;
        let txn = header.transaction_id;
        info!(
            version = header.version,
            command = %header.command,
            txn,
            data = %hex(payload),
            "Decoded header"
        );

        let action = self.protocol.classify(header.command);
        match action {
            Inbound::Ack => {
                self.sender.tracker().resolve(txn);
                info!(txn, "Ack received");
            }
            Inbound::ConfigRequest => {
                info!(txn, "Config request received; sending configuration");
                let packet = self.protocol.config(txn, &self.session.snapshot());
                self.sender.send(&packet, "Requested Configuration").await?;
            }
            Inbound::ConfigWrite => {
                info!(txn, "Write config received; applying");
                let current = match ConfigUpdate::decode(payload) {
                    Ok(update) => self.session.apply(&update),
                    Err(e) => {
                        warn!(txn, error = %e, "Failed to decode config write payload");
                        self.session.snapshot()
                    }
                };
                info!(
                    server = %current.server_address,
                    interval = current.reporting_interval_secs,
                    readings = current.reading_interval_secs,
                    "New config"
                );
                let packet = self.protocol.config(txn, &current);
                self.sender.send(&packet, "Configuration Updated").await?;
            }
            Inbound::UpdateRequest => {
                let request = UpdateRequest::decode(payload)?;
                self.updates.spawn(UpdateJob {
                    transaction_id: txn,
                    request,
                });
            }
            Inbound::Unsupported => {
                warn!(txn, command = %header.command, "Unsupported command {}", header.command);
            }
        }
        Ok(action)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::UpdateConfig;
    use crate::error::DeviceError;
    use crate::protocol::server::{self, Command};
    use crate::protocol::{Body, ConfigReport, Packet, SensorData, UpdateState};
    use crate::tracker::TransactionTracker;
    use crate::types::SessionConfig;
    use crate::variant::ProtocolKind;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    pub(crate) struct Harness {
        pub dispatcher: Arc<CommandDispatcher>,
        pub session: SharedSession,
        pub tracker: Arc<TransactionTracker>,
        pub updates: Arc<UpdateSimulator>,
        pub server: UdpSocket,
        pub device: Arc<UdpSocket>,
    }

    impl Harness {
        pub async fn recv(&self) -> Packet {
            let mut buf = [0u8; 1024];
            let (n, _) = timeout(Duration::from_secs(5), self.server.recv_from(&mut buf))
                .await
                .expect("no packet from device")
                .unwrap();
            server::decode(&buf[..n]).unwrap()
        }

        pub async fn nothing_sent(&self) -> bool {
            let mut buf = [0u8; 1024];
            timeout(Duration::from_millis(200), self.server.recv_from(&mut buf))
                .await
                .is_err()
        }
    }

    pub(crate) async fn harness(kind: ProtocolKind) -> Harness {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let session = SharedSession::new(SessionConfig {
            server_address: server.local_addr().unwrap().to_string(),
            reporting_interval_secs: 120,
            reading_interval_secs: 60,
        });
        let tracker = Arc::new(TransactionTracker::new());
        let sender = Sender::new(
            Arc::clone(&device),
            session.clone(),
            Arc::clone(&tracker),
            Duration::from_secs(2),
        );
        let updates = Arc::new(UpdateSimulator::new(
            sender.clone(),
            UpdateConfig {
                duration: Duration::ZERO,
                failure_rate: 0.0,
            },
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            kind.build(),
            session.clone(),
            sender,
            Arc::clone(&updates),
        ));
        Harness {
            dispatcher,
            session,
            tracker,
            updates,
            server,
            device,
        }
    }

    #[tokio::test]
    async fn ack_resolves_pending_transaction() {
        let h = harness(ProtocolKind::Legacy).await;
        h.tracker.register_wait(5);
        assert_eq!(h.tracker.pending(), 1);

        let action = h.dispatcher.dispatch(&server::ack(5)).await.unwrap();
        assert_eq!(action, Inbound::Ack);
        assert_eq!(h.tracker.pending(), 0);
        assert!(h.tracker.wait(5, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn config_request_echoes_with_inbound_txn() {
        let h = harness(ProtocolKind::Legacy).await;
        h.dispatcher
            .dispatch(&server::command(900, &Command::ConfigRequest))
            .await
            .unwrap();

        let reply = h.recv().await;
        assert_eq!(reply.transaction_id, 900);
        assert_eq!(
            reply.body,
            Body::Config(ConfigReport {
                server_address: h.session.server_address(),
                reporting_interval: 120,
                reading_interval: 60,
            })
        );
    }

    #[tokio::test]
    async fn partial_write_keeps_other_fields() {
        let h = harness(ProtocolKind::Legacy).await;
        let server = h.session.server_address();
        let write = server::command(
            10,
            &Command::ConfigWrite(ConfigUpdate {
                reporting_interval_secs: Some(600),
                ..Default::default()
            }),
        );
        h.dispatcher.dispatch(&write).await.unwrap();
        let echo = h.recv().await;
        assert_eq!(echo.transaction_id, 10);

        h.dispatcher
            .dispatch(&server::command(11, &Command::ConfigRequest))
            .await
            .unwrap();
        assert_eq!(
            h.recv().await.body,
            Body::Config(ConfigReport {
                server_address: server,
                reporting_interval: 600,
                reading_interval: 60,
            })
        );
    }

    #[tokio::test]
    async fn undecodable_write_still_echoes_current_config() {
        let h = harness(ProtocolKind::Legacy).await;
        let datagram = [1, b'C', b'=', 0, 12, 1];
        h.dispatcher.dispatch(&datagram).await.unwrap();
        let echo = h.recv().await;
        assert!(matches!(echo.body, Body::Config(ConfigReport { reporting_interval: 120, .. })));
    }

    #[tokio::test]
    async fn envelope_echo_is_a_telemetry_packet() {
        let h = harness(ProtocolKind::Envelope).await;
        h.dispatcher
            .dispatch(&server::command(3, &Command::ConfigRequest))
            .await
            .unwrap();
        match h.recv().await.body {
            Body::Telemetry(report) => assert!(matches!(report.sensor, SensorData::Config(_))),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[tokio::test]
    async fn short_datagram_is_rejected_without_reply() {
        let h = harness(ProtocolKind::Legacy).await;
        let err = h.dispatcher.dispatch(&[1, b'A']).await.unwrap_err();
        assert!(matches!(err, DeviceError::MalformedPacket { .. }));
        assert!(h.nothing_sent().await);
    }

    #[tokio::test]
    async fn unsupported_command_sends_nothing() {
        let h = harness(ProtocolKind::Legacy).await;
        let action = h.dispatcher.dispatch(&[1, b'Z', b'Z', 0, 1]).await.unwrap();
        assert_eq!(action, Inbound::Unsupported);
        assert!(h.nothing_sent().await);
    }

    #[tokio::test]
    async fn update_request_spawns_job_on_legacy_only() {
        let request = server::command(
            40,
            &Command::UpdateRequest(UpdateRequest {
                component: "modem".to_string(),
                url: "http://example.invalid/m.bin".to_string(),
                arguments: String::new(),
            }),
        );

        let h = harness(ProtocolKind::Legacy).await;
        let action = h.dispatcher.dispatch(&request).await.unwrap();
        assert_eq!(action, Inbound::UpdateRequest);
        let started = h.recv().await;
        assert_eq!(started.transaction_id, 40);
        let mut handles = h.updates.take_handles();
        assert_eq!(handles.pop().unwrap().await.unwrap(), UpdateState::Success);

        let h = harness(ProtocolKind::Envelope).await;
        let action = h.dispatcher.dispatch(&request).await.unwrap();
        assert_eq!(action, Inbound::Unsupported);
        assert!(h.updates.take_handles().is_empty());
    }
}
