use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid server address '{0}', expected host:port")]
    InvalidServerAddress(String),

    #[error("IMEI must be provided via config file or CLI (--imei)")]
    MissingIdentity,

    #[error("Malformed packet: needed {needed} bytes, got {got}")]
    MalformedPacket { needed: usize, got: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),
}

impl From<serde_yaml::Error> for DeviceError {
    fn from(e: serde_yaml::Error) -> Self {
        DeviceError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(e: serde_json::Error) -> Self {
        DeviceError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
