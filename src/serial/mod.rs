pub mod interface;
pub mod mock;
pub mod protocol;

pub use interface::{NativeOpener, PortOpener, SerialInterface, SerialPortIO};
pub use protocol::{Measurement, ReadCommand, SensorDriver};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Byte framing and timing for one serial link
#[derive(Debug, Clone, PartialEq)]
pub struct PortSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// How a failed serial operation should be handled by the recovery supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Link-level trouble: close, reopen and retry
    Transport,
    /// The device answered but the payload did not parse
    Parse,
    /// Anything we could not classify
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Could not connect to serial device {port}: {reason}")]
    ConnectionError { port: String, reason: String },

    #[error("Write timeout on {port}")]
    WriteTimeout { port: String },

    #[error("No data on receive buffer of {port}")]
    NoData { port: String },

    #[error("Did not receive EOL character from {port}, assuming corrupted data (received {partial:?})")]
    CorruptData { port: String, partial: String },

    #[error("I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid data type from {port}: cannot convert {token:?} to float (raw line {raw_line:?})")]
    InvalidDataType {
        port: String,
        token: String,
        raw_line: String,
    },

    #[error("Unknown fault on {port}: {reason}")]
    UnknownFault { port: String, reason: String },
}

impl SerialError {
    pub fn class(&self) -> FaultClass {
        match self {
            SerialError::ConnectionError { .. }
            | SerialError::WriteTimeout { .. }
            | SerialError::NoData { .. }
            | SerialError::CorruptData { .. }
            | SerialError::Io { .. } => FaultClass::Transport,
            SerialError::InvalidDataType { .. } => FaultClass::Parse,
            SerialError::UnknownFault { .. } => FaultClass::Unknown,
        }
    }

    pub fn port(&self) -> &str {
        match self {
            SerialError::ConnectionError { port, .. }
            | SerialError::WriteTimeout { port }
            | SerialError::NoData { port }
            | SerialError::CorruptData { port, .. }
            | SerialError::Io { port, .. }
            | SerialError::InvalidDataType { port, .. }
            | SerialError::UnknownFault { port, .. } => port,
        }
    }

    /// Map an I/O error raised while the link was in use.
    pub(crate) fn from_io(port: &str, error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::NotFound
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::PermissionDenied => SerialError::ConnectionError {
                port: port.to_string(),
                reason: error.to_string(),
            },
            _ => SerialError::Io {
                port: port.to_string(),
                source: error,
            },
        }
    }

    /// Map an error raised by the serialport backend while opening the link.
    pub(crate) fn from_serialport(port: &str, error: serialport::Error) -> Self {
        match error.kind() {
            serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(_) => {
                SerialError::ConnectionError {
                    port: port.to_string(),
                    reason: error.to_string(),
                }
            }
            _ => SerialError::UnknownFault {
                port: port.to_string(),
                reason: error.to_string(),
            },
        }
    }
}

/// A classified serial failure attributed to one sensor
#[derive(Debug, thiserror::Error)]
#[error("SerialSensor error on sensor \"{sensor}\": {error}")]
pub struct SensorFault {
    pub sensor: String,
    #[source]
    pub error: SerialError,
}

pub type Result<T> = std::result::Result<T, SerialError>;
