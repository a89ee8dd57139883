use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::info;

use crate::config::MotionConfig;
use crate::net::Sender;
use crate::protocol::{clamp_u32, Report, SensorData, MAX_READINGS_PER_PACKET};
use crate::simulate::{SensorSimulator, RSSI};
use crate::types::{unix_now, DeviceIdentity, Reading, SessionConfig, SharedSession};
use crate::variant::Protocol;

pub const MAX_SLEEP_SEGMENT: Duration = Duration::from_secs(60);

/// An open motion bracket, from motion start until motion stop.
struct MotionWindow {
    started_at: u32,
    started: Instant,
}

pub struct Scheduler {
    identity: DeviceIdentity,
    protocol: Arc<dyn Protocol>,
    session: SharedSession,
    sender: Sender,
    sensors: SensorSimulator,
    motion: MotionConfig,
    shutdown: watch::Receiver<bool>,
    last_motion_end: Instant,
}

impl Scheduler {
    pub fn new(
        identity: DeviceIdentity,
        protocol: Arc<dyn Protocol>,
        session: SharedSession,
        sender: Sender,
        sensors: SensorSimulator,
        motion: MotionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            identity,
            protocol,
            session,
            sender,
            sensors,
            motion,
            shutdown,
            last_motion_end: Instant::now(),
        }
    }

    fn next_txn(&self) -> u16 {
        self.sender.tracker().allocate()
    }

    pub async fn startup(&mut self) {
        let txn = self.next_txn();
        let power_on = self.protocol.startup(txn, &self.identity);
        self.sender.send_and_wait(&power_on, "Power On").await;

        let txn = self.next_txn();
        let config = self.protocol.config(txn, &self.session.snapshot());
        self.sender
            .send_and_wait(&config, "Initial Configuration")
            .await;
    }

    pub async fn run(mut self) {
        self.startup().await;
        self.last_motion_end = Instant::now();

        loop {
            if self.stopped() {
                break;
            }
            let iteration = Instant::now();
            // Read fresh every iteration: a config write may have changed it.
            let session = self.session.snapshot();

            let keep_going = if self.motion_due() {
                self.motion_bracket().await
            } else {
                self.send_telemetry(&session).await;
                true
            };
            if !keep_going || !self.sleep_until_next_report(iteration).await {
                break;
            }
        }
        info!("Scheduler stopping");
    }

    fn stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn motion_due(&self) -> bool {
        self.motion.enabled()
            && self.last_motion_end.elapsed() >= Duration::from_secs(self.motion.interval_secs)
    }

    /// Returns false once shutdown has been requested.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => {}
            changed = self.shutdown.changed() => {
                if changed.is_err() {
                    // Nobody can signal shutdown any more; just sleep.
                    sleep(duration).await;
                }
            }
        }
        !self.stopped()
    }

    async fn sleep_until_next_report(&mut self, iteration: Instant) -> bool {
        loop {
            let interval = Duration::from_secs(self.session.snapshot().reporting_interval_secs);
            let deadline = iteration + interval;
            let now = Instant::now();
            if now >= deadline {
                return !self.stopped();
            }
            let segment = (deadline - now).min(MAX_SLEEP_SEGMENT);
            if !self.pause(segment).await {
                return false;
            }
        }
    }

    /// One report of N readings, split over consecutive packets when it
    /// would not fit in a single datagram.
    pub async fn send_telemetry(&mut self, session: &SessionConfig) -> bool {
        let timestamp = unix_now();
        let location = self.sensors.location();
        let battery = self.sensors.battery();

        let count = session.readings_per_report();
        let step = session.reading_step_secs();
        let span = step.saturating_mul(count as u64 - 1);
        let first_timestamp = timestamp.saturating_sub(clamp_u32(span));
        let records: Vec<Reading> = (0..count).map(|_| self.sensors.reading()).collect();

        let mut acked = true;
        for (i, chunk) in records.chunks(MAX_READINGS_PER_PACKET).enumerate() {
            let offset = step.saturating_mul((i * MAX_READINGS_PER_PACKET) as u64);
            let report = Report {
                timestamp,
                location: Some(location.clone()),
                sensor: SensorData::Multi {
                    battery,
                    rssi: RSSI,
                    first_timestamp: first_timestamp.saturating_add(clamp_u32(offset)),
                    interval: clamp_u32(step),
                    records: chunk.to_vec(),
                },
            };
            let txn = self.next_txn();
            let packet = self.protocol.telemetry(txn, report);
            acked &= self.sender.send_and_wait(&packet, "Telemetry").await;
        }
        acked
    }

    /// Motion start, the motion itself, then motion stop with the steps taken.
    /// Returns false if shutdown interrupted the bracket.
    async fn motion_bracket(&mut self) -> bool {
        let window = MotionWindow {
            started_at: unix_now(),
            started: Instant::now(),
        };
        let start = Report {
            timestamp: window.started_at,
            location: Some(self.sensors.location()),
            sensor: SensorData::Null,
        };
        let txn = self.next_txn();
        let packet = self.protocol.motion_start(txn, start);
        self.sender.send_and_wait(&packet, "Motion Start").await;

        if !self.pause(Duration::from_secs(self.motion.duration_secs)).await {
            return false;
        }

        let steps = self.sensors.steps(self.motion.duration_secs);
        let stop = Report {
            timestamp: unix_now(),
            location: Some(self.sensors.location()),
            sensor: SensorData::Steps {
                battery: self.sensors.battery(),
                rssi: RSSI,
                steps,
            },
        };
        let txn = self.next_txn();
        let packet = self.protocol.motion_stop(txn, stop);
        self.sender.send_and_wait(&packet, "Motion Stop").await;

        self.last_motion_end = Instant::now();
        info!(
            started_at = window.started_at,
            elapsed_ms = window.started.elapsed().as_millis() as u64,
            steps,
            "Motion window closed"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::{harness, Harness};
    use crate::protocol::{server, Body, CommandCode, Packet};
    use crate::receiver::Receiver;
    use crate::simulate::LocationMode;
    use crate::types::ConfigUpdate;
    use crate::variant::ProtocolKind;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::time::timeout;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            imei: "123456789012345".to_string(),
            customer_code: "00000000".to_string(),
            iccid: None,
            mcc: "001".to_string(),
            mnc: "01".to_string(),
            rat: "LTE-M".to_string(),
            software_version: "generic-udp-0.1.0".to_string(),
            modem_version: "generic".to_string(),
        }
    }

    struct Session {
        h: Harness,
        stop: watch::Sender<bool>,
        scheduler: tokio::task::JoinHandle<()>,
    }

    impl Session {
        async fn next_acked(&self) -> (Packet, Instant) {
            self.next_acked_within(Duration::from_secs(10)).await
        }

        /// Reads the next device packet and acks it like a real server.
        async fn next_acked_within(&self, wait: Duration) -> (Packet, Instant) {
            let mut buf = [0u8; 2048];
            let (n, from) = timeout(wait, self.h.server.recv_from(&mut buf))
                .await
                .expect("device went quiet")
                .unwrap();
            let at = Instant::now();
            let packet = server::decode(&buf[..n]).unwrap();
            self.h
                .server
                .send_to(&server::ack(packet.transaction_id), from)
                .await
                .unwrap();
            (packet, at)
        }

        async fn finish(self) {
            self.stop.send(true).unwrap();
            timeout(Duration::from_secs(5), self.scheduler)
                .await
                .expect("scheduler ignored shutdown")
                .unwrap();
        }
    }

    async fn start(kind: ProtocolKind, interval: u64, readings: u64, motion: MotionConfig) -> Session {
        let h = harness(kind).await;
        h.session.apply(&ConfigUpdate {
            server_address: None,
            reporting_interval_secs: Some(interval),
            reading_interval_secs: Some(readings),
        });

        let (stop, stop_rx) = watch::channel(false);
        let receiver = Receiver::new(Arc::clone(&h.device), Arc::clone(&h.dispatcher), stop_rx.clone());
        tokio::spawn(receiver.run());

        let sender = Sender::new(
            Arc::clone(&h.device),
            h.session.clone(),
            Arc::clone(&h.tracker),
            Duration::from_secs(2),
        );
        let scheduler = Scheduler::new(
            identity(),
            kind.build(),
            h.session.clone(),
            sender,
            SensorSimulator::with_rng(LocationMode::Simulated, StdRng::seed_from_u64(5)),
            motion,
            stop_rx,
        );
        let scheduler = tokio::spawn(scheduler.run());
        Session { h, stop, scheduler }
    }

    #[tokio::test]
    async fn startup_then_telemetry_with_two_readings() {
        let no_motion = MotionConfig {
            duration_secs: 0,
            interval_secs: 0,
        };
        let s = start(ProtocolKind::Legacy, 120, 60, no_motion).await;

        let (power_on, _) = s.next_acked().await;
        assert_eq!(power_on.command(), CommandCode::POWER_ON);
        assert_eq!(power_on.transaction_id, 1);

        let (config, _) = s.next_acked().await;
        assert_eq!(config.command(), CommandCode::CONFIG);
        assert_eq!(config.transaction_id, 2);

        let (telemetry, _) = s.next_acked().await;
        assert_eq!(telemetry.transaction_id, 3);
        match telemetry.body {
            Body::Telemetry(Report {
                timestamp,
                sensor:
                    SensorData::Multi {
                        first_timestamp,
                        interval,
                        records,
                        battery,
                        ..
                    },
                ..
            }) => {
                assert_eq!(records.len(), 2);
                assert_eq!(interval, 60);
                assert_eq!(timestamp - first_timestamp, 60);
                assert!((5..=100).contains(&battery));
            }
            other => panic!("expected telemetry, got {:?}", other),
        }

        s.finish().await;
    }

    #[tokio::test]
    async fn motion_bracket_after_interval() {
        let motion = MotionConfig {
            duration_secs: 1,
            interval_secs: 1,
        };
        let s = start(ProtocolKind::Legacy, 1, 1, motion).await;

        let mut seen = Vec::new();
        let mut start_at = None;
        loop {
            let (packet, at) = s.next_acked().await;
            seen.push(packet.command());
            if packet.command() == CommandCode::MOTION_START {
                start_at = Some(at);
            }
            if packet.command() == CommandCode::MOTION_STOP {
                let started = start_at.expect("motion stop before motion start");
                assert!(at - started >= Duration::from_millis(900));
                match packet.body {
                    Body::MotionStop(Report {
                        sensor: SensorData::Steps { .. },
                        ..
                    }) => {}
                    other => panic!("expected steps, got {:?}", other),
                }
                break;
            }
        }

        assert_eq!(
            &seen[..3],
            &[CommandCode::POWER_ON, CommandCode::CONFIG, CommandCode::TELEMETRY]
        );
        s.finish().await;
    }

    #[tokio::test]
    async fn envelope_startup_uses_telemetry_packets() {
        let no_motion = MotionConfig {
            duration_secs: 0,
            interval_secs: 0,
        };
        let s = start(ProtocolKind::Envelope, 120, 60, no_motion).await;
        for expected_txn in 1..=3 {
            let (packet, _) = s.next_acked().await;
            assert_eq!(packet.command(), CommandCode::TELEMETRY);
            assert_eq!(packet.transaction_id, expected_txn);
        }
        s.finish().await;
    }

    #[tokio::test]
    async fn next_iteration_uses_updated_interval() {
        let no_motion = MotionConfig {
            duration_secs: 0,
            interval_secs: 0,
        };
        let s = start(ProtocolKind::Legacy, 2, 1, no_motion).await;
        s.next_acked().await;
        s.next_acked().await;
        let (first, _) = s.next_acked().await;
        assert_eq!(multi(&first).2, 2);

        s.h.session.apply(&ConfigUpdate {
            reporting_interval_secs: Some(3),
            ..Default::default()
        });

        let (second, _) = s.next_acked().await;
        assert_eq!(multi(&second).2, 3);
        s.finish().await;
    }

    fn multi(packet: &Packet) -> (u32, u32, usize) {
        match &packet.body {
            Body::Telemetry(Report {
                timestamp,
                sensor:
                    SensorData::Multi {
                        first_timestamp,
                        records,
                        ..
                    },
                ..
            }) => (*timestamp, *first_timestamp, records.len()),
            other => panic!("expected telemetry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn long_report_is_split_across_packets() {
        let no_motion = MotionConfig {
            duration_secs: 0,
            interval_secs: 0,
        };
        // 3600 / 10 = 360 readings, more than one datagram holds.
        let s = start(ProtocolKind::Legacy, 3600, 10, no_motion).await;
        s.next_acked().await;
        s.next_acked().await;

        let (first, _) = s.next_acked().await;
        let (second, _) = s.next_acked().await;
        assert_eq!((first.transaction_id, second.transaction_id), (3, 4));

        let (ts, first_start, first_len) = multi(&first);
        let (ts2, second_start, second_len) = multi(&second);
        assert_eq!(ts, ts2);
        assert_eq!(first_len, MAX_READINGS_PER_PACKET);
        assert_eq!(first_len + second_len, 360);
        assert_eq!(second_start - first_start, 300 * 10);
        assert_eq!(ts - first_start, 359 * 10);

        s.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn motion_starts_after_its_interval_and_lasts_its_duration() {
        let motion = MotionConfig {
            duration_secs: 10,
            interval_secs: 300,
        };
        let s = start(ProtocolKind::Legacy, 120, 60, motion).await;
        let wait = Duration::from_secs(3600);

        s.next_acked_within(wait).await;
        let (_, started_up) = s.next_acked_within(wait).await;

        // Telemetry at 0s, 120s and 240s; motion is due at the 360s iteration.
        let mut telemetry = 0;
        let motion_start = loop {
            let (packet, at) = s.next_acked_within(wait).await;
            match packet.command() {
                CommandCode::TELEMETRY => telemetry += 1,
                CommandCode::MOTION_START => break at,
                other => panic!("unexpected {}", other),
            }
        };
        assert_eq!(telemetry, 3);
        assert!(motion_start - started_up >= Duration::from_secs(300));

        let (stop, stopped) = s.next_acked_within(wait).await;
        assert_eq!(stop.command(), CommandCode::MOTION_STOP);
        let window = stopped - motion_start;
        assert!(window >= Duration::from_secs(10));
        assert!(window < Duration::from_secs(11));
        assert!(matches!(
            stop.body,
            Body::MotionStop(Report {
                sensor: SensorData::Steps { .. },
                ..
            })
        ));

        s.finish().await;
    }
}
