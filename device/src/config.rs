use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{DeviceError, Result};
use crate::net::parse_server;
use crate::simulate::LocationMode;
use crate::tracker::DEFAULT_ACK_TIMEOUT;
use crate::types::{DeviceIdentity, SessionConfig};
use crate::variant::ProtocolKind;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// UDP device simulator speaking the compact binary protocol
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server address "host:port"
    #[arg(short, long, env = "DEVICE_SERVER")]
    pub server: Option<String>,

    /// Reporting interval in seconds
    #[arg(short, long, env = "DEVICE_INTERVAL")]
    pub interval: Option<u64>,

    /// Reading interval in seconds
    #[arg(short, long, env = "DEVICE_READINGS")]
    pub readings: Option<u64>,

    /// IMEI (15 digits)
    #[arg(short = 'm', long, env = "DEVICE_IMEI")]
    pub imei: Option<String>,

    /// ICCID (optional, logged only)
    #[arg(long, env = "DEVICE_ICCID")]
    pub iccid: Option<String>,

    /// Customer code (even-length hex)
    #[arg(short, long, env = "DEVICE_CODE")]
    pub code: Option<String>,

    /// Mobile Country Code
    #[arg(long)]
    pub mcc: Option<String>,

    /// Mobile Network Code
    #[arg(long)]
    pub mnc: Option<String>,

    /// Radio access technology (e.g. LTE-M, NB-IoT)
    #[arg(long)]
    pub rat: Option<String>,

    /// Packet set to speak
    #[arg(long, value_enum, env = "DEVICE_PROTOCOL")]
    pub protocol: Option<ProtocolKind>,

    /// Seconds to wait for an ack before giving up
    #[arg(long, env = "DEVICE_ACK_TIMEOUT")]
    pub ack_timeout: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Path to a YAML (or .json) config file
    #[arg(long, env = "DEVICE_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                map.insert(key.to_string(), value);
            }
        };
        put("server", self.server.clone().map(Value::from));
        put("interval", self.interval.map(Value::from));
        put("readings", self.readings.map(Value::from));
        put("imei", self.imei.clone().map(Value::from));
        put("iccid", self.iccid.clone().map(Value::from));
        put("code", self.code.clone().map(Value::from));
        put("mcc", self.mcc.clone().map(Value::from));
        put("mnc", self.mnc.clone().map(Value::from));
        put("rat", self.rat.clone().map(Value::from));
        put("protocol", self.protocol.map(|p| Value::from(p.name())));
        put("ackTimeout", self.ack_timeout.map(Value::from));
        put("logFormat", self.log_json.then(|| Value::from("json")));
        map
    }
}

fn defaults() -> Value {
    json!({
        "server": "udp-eu.tartabit.com:10106",
        "interval": 120,
        "readings": 60,
        "code": "00000000",
        "mcc": "001",
        "mnc": "01",
        "rat": "LTE-M",
        "updateDuration": 5,
        "updateFailureRate": 0.0,
        "protocol": "legacy",
        "ackTimeout": 30,
        "logFormat": "text",
    })
}

/// Layered key lookup: CLI > config file > built-in defaults.
pub struct ConfigSource {
    cli: Map<String, Value>,
    file: Value,
    defaults: Value,
}

impl ConfigSource {
    pub fn from_parts(cli: Map<String, Value>, file: Value) -> Self {
        Self {
            cli,
            file,
            defaults: defaults(),
        }
    }

    pub fn load(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    load_file(path)?
                } else {
                    Value::Null
                }
            }
        };
        Ok(Self::from_parts(cli.overrides(), file))
    }

    /// Raw value for `key`. Dotted keys walk nested maps in the file.
    pub fn lookup(&self, key: &str) -> Option<Value> {
        let dotted = key.contains('.');
        if !dotted {
            if let Some(v) = self.cli.get(key) {
                return Some(v.clone());
            }
        }

        let from_file = if dotted {
            walk(&self.file, key).or_else(|| match key {
                "location.lat" => self.file.get("lat"),
                "location.lon" => self.file.get("lon"),
                _ => None,
            })
        } else {
            self.file.get(key)
        };
        if let Some(v) = from_file.filter(|v| !v.is_null()) {
            return Some(v.clone());
        }

        if dotted {
            return None;
        }
        self.defaults.get(key).cloned()
    }

    pub fn log_json(&self) -> bool {
        self.get("logFormat", LogFormat::Text) == LogFormat::Json
    }

    /// Typed lookup falling back to `default` when absent or unusable.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.lookup(key) {
            None => default,
            Some(value) => coerce(value.clone()).unwrap_or_else(|| {
                warn!(key, value = %value, "Ignoring unusable config value");
                default
            }),
        }
    }
}

fn walk<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(root, |cur, part| cur.as_object()?.get(part))
}

/// Converts between scalar shapes the way a loosely typed YAML file needs:
/// `"120"` reads as a number and `001` reads as a string.
fn coerce<T: DeserializeOwned>(value: Value) -> Option<T> {
    if let Ok(v) = serde_json::from_value(value.clone()) {
        return Some(v);
    }
    let alternate = match &value {
        Value::String(s) => serde_json::from_str(s.trim()).ok()?,
        Value::Number(_) | Value::Bool(_) => Value::String(value.to_string()),
        _ => return None,
    };
    serde_json::from_value(alternate).ok()
}

fn load_file(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path).map_err(|e| {
        DeviceError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let value: Value = if is_json {
        serde_json::from_str(&contents)?
    } else {
        serde_yaml::from_str(&contents)?
    };
    match value {
        Value::Object(_) | Value::Null => Ok(value),
        _ => Err(DeviceError::Config(format!(
            "{} must contain a mapping at the top level",
            path.display()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionConfig {
    pub duration_secs: u64,
    pub interval_secs: u64,
}

impl MotionConfig {
    pub fn enabled(&self) -> bool {
        self.duration_secs > 0 && self.interval_secs > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationConfig {
    pub mode: LocationMode,
    pub start: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateConfig {
    pub duration: Duration,
    pub failure_rate: f64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            failure_rate: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub identity: DeviceIdentity,
    pub session: SessionConfig,
    pub motion: MotionConfig,
    pub location: LocationConfig,
    pub update: UpdateConfig,
    pub protocol: ProtocolKind,
    pub ack_timeout: Duration,
}

impl DeviceConfig {
    pub fn resolve(source: &ConfigSource) -> Result<Self> {
        let imei: String = source.get("imei", String::new());
        if imei.trim().is_empty() {
            return Err(DeviceError::MissingIdentity);
        }

        let server_address: String = source.get("server", String::new());
        parse_server(&server_address)?;

        let mcc: String = source.get("mcc", "001".to_string());
        let mnc: String = source.get("mnc", "01".to_string());

        let identity = DeviceIdentity {
            imei,
            customer_code: source.get("code", "00000000".to_string()),
            iccid: source.get("iccid", None),
            mcc: mcc.clone(),
            mnc: mnc.clone(),
            rat: source.get("rat", "LTE-M".to_string()),
            software_version: format!("generic-udp-{}", env!("CARGO_PKG_VERSION")),
            modem_version: "generic".to_string(),
        };

        let session = SessionConfig {
            server_address,
            reporting_interval_secs: source.get("interval", 120),
            reading_interval_secs: source.get("readings", 60),
        };

        let motion = MotionConfig {
            duration_secs: source.get("motionDuration", 0),
            interval_secs: source.get("motionInterval", 0),
        };

        let location_type: String = source.get("location.type", "simulated".to_string());
        let mode = if location_type.eq_ignore_ascii_case("cellid") {
            LocationMode::CellId { mcc, mnc }
        } else {
            LocationMode::Simulated
        };
        let location = LocationConfig {
            mode,
            start: start_point(source),
        };

        let update_defaults = UpdateConfig::default();
        let update = UpdateConfig {
            duration: Duration::from_secs(
                source.get("updateDuration", update_defaults.duration.as_secs()),
            ),
            failure_rate: source
                .get("updateFailureRate", update_defaults.failure_rate)
                .clamp(0.0, 1.0),
        };

        Ok(Self {
            identity,
            session,
            motion,
            location,
            update,
            protocol: source.get("protocol", ProtocolKind::Legacy),
            ack_timeout: Duration::from_secs(source.get("ackTimeout", DEFAULT_ACK_TIMEOUT.as_secs())),
        })
    }
}

fn start_point(source: &ConfigSource) -> Option<(f64, f64)> {
    let (lat, lon) = (source.lookup("location.lat")?, source.lookup("location.lon")?);
    match (coerce::<f64>(lat.clone()), coerce::<f64>(lon.clone())) {
        (Some(lat), Some(lon)) => Some((lat, lon)),
        _ => {
            warn!(lat = %lat, lon = %lon, "Invalid configured lat/lon, using default start point");
            None
        }
    }
}
