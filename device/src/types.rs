use chrono::Utc;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub imei: String,
    pub customer_code: String,
    pub iccid: Option<String>,
    pub mcc: String,
    pub mnc: String,
    pub rat: String,
    pub software_version: String,
    pub modem_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub server_address: String,
    pub reporting_interval_secs: u64,
    pub reading_interval_secs: u64,
}

impl SessionConfig {
    /// Reading interval, never below one second.
    pub fn reading_step_secs(&self) -> u64 {
        self.reading_interval_secs.max(1)
    }

    /// Number of readings folded into one telemetry report.
    pub fn readings_per_report(&self) -> usize {
        let n = self.reporting_interval_secs / self.reading_step_secs();
        usize::try_from(n).unwrap_or(usize::MAX).max(1)
    }

    /// Applies the fields present in `update`; absent fields keep their value.
    pub fn apply(&mut self, update: &ConfigUpdate) {
        if let Some(server) = update.server_address.as_deref().filter(|s| !s.is_empty()) {
            self.server_address = server.to_string();
        }
        if let Some(interval) = update.reporting_interval_secs {
            self.reporting_interval_secs = interval;
        }
        if let Some(readings) = update.reading_interval_secs {
            self.reading_interval_secs = readings;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub server_address: Option<String>,
    pub reporting_interval_secs: Option<u64>,
    pub reading_interval_secs: Option<u64>,
}

/// Session configuration shared between the receiver (writer) and the
/// scheduler (reader). Readers always get the latest committed snapshot.
#[derive(Debug, Clone)]
pub struct SharedSession(Arc<RwLock<SessionConfig>>);

impl SharedSession {
    pub fn new(config: SessionConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub fn snapshot(&self) -> SessionConfig {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn server_address(&self) -> String {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .server_address
            .clone()
    }

    /// Applies a partial update and returns the resulting configuration.
    pub fn apply(&self, update: &ConfigUpdate) -> SessionConfig {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        guard.apply(update);
        guard.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f32,
    pub humidity: f32,
}

/// Current unix time in seconds, as carried on the wire.
pub fn unix_now() -> u32 {
    u32::try_from(Utc::now().timestamp()).unwrap_or(0)
}
