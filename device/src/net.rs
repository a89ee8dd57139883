use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, UdpSocket};
use tracing::{error, info, warn};

use crate::error::{DeviceError, Result};
use crate::protocol::Packet;
use crate::tracker::TransactionTracker;
use crate::types::SharedSession;

pub fn parse_server(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| DeviceError::InvalidServerAddress(addr.to_string()))?;
    if host.is_empty() {
        return Err(DeviceError::InvalidServerAddress(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| DeviceError::InvalidServerAddress(addr.to_string()))?;
    Ok((host.to_string(), port))
}

async fn resolve_server(addr: &str) -> Result<SocketAddr> {
    let (host, port) = parse_server(addr)?;
    let mut candidates = lookup_host((host.as_str(), port)).await?;
    candidates
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| DeviceError::InvalidServerAddress(addr.to_string()))
}

/// Writes packets to the server and, when asked, waits for their ack.
#[derive(Clone)]
pub struct Sender {
    socket: Arc<UdpSocket>,
    session: SharedSession,
    tracker: Arc<TransactionTracker>,
    ack_timeout: Duration,
}

impl Sender {
    pub fn new(
        socket: Arc<UdpSocket>,
        session: SharedSession,
        tracker: Arc<TransactionTracker>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            session,
            tracker,
            ack_timeout,
        }
    }

    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        &self.tracker
    }

    /// Encodes and transmits `packet` to the current server address.
    pub async fn send(&self, packet: &Packet, reason: &str) -> Result<()> {
        let bytes = packet.encode()?;
        let server = self.session.server_address();
        let target = resolve_server(&server).await?;
        self.socket.send_to(&bytes, target).await?;
        info!(
            reason,
            txn = packet.transaction_id,
            command = %packet.command(),
            bytes = bytes.len(),
            server = %target,
            "{}: {}",
            reason,
            packet
        );
        Ok(())
    }

    /// Sends `packet` and waits for its ack. A timeout is only logged; the
    /// caller carries on either way.
    pub async fn send_and_wait(&self, packet: &Packet, reason: &str) -> bool {
        let txn = packet.transaction_id;
        self.tracker.register_wait(txn);

        if let Err(e) = self.send(packet, reason).await {
            error!(reason, txn, error = %e, "Failed to send packet");
            self.tracker.abandon(txn);
            return false;
        }

        let acked = self.tracker.wait(txn, self.ack_timeout).await;
        if !acked {
            warn!(reason, txn, "Ack timeout for txn {}", txn);
        }
        acked
    }
}
