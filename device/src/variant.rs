use std::sync::Arc;

use clap::ValueEnum;
use serde::Deserialize;

use crate::protocol::{
    clamp_u32, Body, CommandCode, ConfigReport, Packet, PowerOn, Report, SensorData,
};
use crate::types::{unix_now, DeviceIdentity, SessionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Legacy,
    Envelope,
}

impl ProtocolKind {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Legacy => "legacy",
            ProtocolKind::Envelope => "envelope",
        }
    }

    pub fn build(self) -> Arc<dyn Protocol> {
        match self {
            ProtocolKind::Legacy => Arc::new(Legacy),
            ProtocolKind::Envelope => Arc::new(Envelope),
        }
    }
}

/// What an inbound command asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Ack,
    ConfigRequest,
    ConfigWrite,
    UpdateRequest,
    Unsupported,
}

pub trait Protocol: Send + Sync {
    fn startup(&self, txn: u16, identity: &DeviceIdentity) -> Packet;

    fn config(&self, txn: u16, session: &SessionConfig) -> Packet;

    fn telemetry(&self, txn: u16, report: Report) -> Packet;

    fn motion_start(&self, txn: u16, report: Report) -> Packet;

    fn motion_stop(&self, txn: u16, report: Report) -> Packet;

    /// Maps an inbound command code to the action it requests.
    fn classify(&self, command: CommandCode) -> Inbound;
}

fn power_on(identity: &DeviceIdentity) -> PowerOn {
    PowerOn {
        imei: identity.imei.clone(),
        customer_code: identity.customer_code.clone(),
        software_version: identity.software_version.clone(),
        modem_version: identity.modem_version.clone(),
        mcc: identity.mcc.clone(),
        mnc: identity.mnc.clone(),
        rat: identity.rat.clone(),
    }
}

fn config_report(session: &SessionConfig) -> ConfigReport {
    ConfigReport {
        server_address: session.server_address.clone(),
        reporting_interval: clamp_u32(session.reporting_interval_secs),
        reading_interval: clamp_u32(session.reading_interval_secs),
    }
}

fn classify_common(command: CommandCode) -> Inbound {
    if command.is_ack() {
        Inbound::Ack
    } else if command.is_config_write() {
        Inbound::ConfigWrite
    } else if command.0[0] == b'C' {
        Inbound::ConfigRequest
    } else {
        Inbound::Unsupported
    }
}

pub struct Legacy;

impl Protocol for Legacy {
    fn startup(&self, txn: u16, identity: &DeviceIdentity) -> Packet {
        Packet::new(txn, Body::PowerOn(power_on(identity)))
    }

    fn config(&self, txn: u16, session: &SessionConfig) -> Packet {
        Packet::new(txn, Body::Config(config_report(session)))
    }

    fn telemetry(&self, txn: u16, report: Report) -> Packet {
        Packet::new(txn, Body::Telemetry(report))
    }

    fn motion_start(&self, txn: u16, report: Report) -> Packet {
        Packet::new(txn, Body::MotionStart(report))
    }

    fn motion_stop(&self, txn: u16, report: Report) -> Packet {
        Packet::new(txn, Body::MotionStop(report))
    }

    fn classify(&self, command: CommandCode) -> Inbound {
        if command == CommandCode::UPDATE_REQUEST {
            return Inbound::UpdateRequest;
        }
        classify_common(command)
    }
}

pub struct Envelope;

impl Envelope {
    fn envelope(txn: u16, sensor: SensorData) -> Packet {
        Packet::new(
            txn,
            Body::Telemetry(Report {
                timestamp: unix_now(),
                location: None,
                sensor,
            }),
        )
    }
}

impl Protocol for Envelope {
    fn startup(&self, txn: u16, identity: &DeviceIdentity) -> Packet {
        Self::envelope(txn, SensorData::Identity(power_on(identity)))
    }

    fn config(&self, txn: u16, session: &SessionConfig) -> Packet {
        Self::envelope(txn, SensorData::Config(config_report(session)))
    }

    fn telemetry(&self, txn: u16, report: Report) -> Packet {
        Packet::new(txn, Body::Telemetry(report))
    }

    fn motion_start(&self, txn: u16, report: Report) -> Packet {
        Packet::new(txn, Body::Telemetry(report))
    }

    fn motion_stop(&self, txn: u16, report: Report) -> Packet {
        Packet::new(txn, Body::Telemetry(report))
    }

    fn classify(&self, command: CommandCode) -> Inbound {
        classify_common(command)
    }
}
