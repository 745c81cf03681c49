pub mod memory;
pub mod retry;
pub mod service;

pub use memory::MemoryStore;
pub use retry::RetryingStore;
pub use service::HttpRemoteStore;

use std::collections::BTreeMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::BoardConfig;
use crate::serial::Measurement;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Worth retrying: transport failures, timeouts, server errors
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Remote store rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Could not decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// The document store holding configuration records and telemetry.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the configuration record `id`; `None` means it does not exist.
    async fn fetch_config(&self, id: &str) -> Result<Option<BoardConfig>>;

    /// Insert or replace the configuration record `id`.
    async fn upsert_config(&self, id: &str, config: &BoardConfig) -> Result<()>;

    /// Append one reading to the telemetry collection.
    async fn insert_reading(&self, reading: &AggregatedReading) -> Result<()>;

    /// Replace the stored agent log of board `id`.
    async fn upload_log(&self, id: &str, contents: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasuredValue {
    pub value: f64,
    pub unit: String,
}

/// Every enabled sensor's measurements from one cycle.
///
/// Serializes flat: `{"Temp": {"value": 21.4, "unit": "C"}, ..., "timestamp": 1714557600.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReading {
    #[serde(flatten)]
    pub values: BTreeMap<String, MeasuredValue>,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl AggregatedReading {
    /// Later measurements with the same name replace earlier ones.
    pub fn new(measurements: Vec<Measurement>, timestamp: f64) -> Self {
        let mut values = BTreeMap::new();
        for measurement in measurements {
            if measurement.name == "timestamp" {
                log::warn!("Dropping measurement named \"timestamp\", the name is reserved");
                continue;
            }
            values.insert(
                measurement.name,
                MeasuredValue {
                    value: measurement.value,
                    unit: measurement.unit,
                },
            );
        }
        Self { values, timestamp }
    }

    /// Reading stamped with the current wall-clock time
    pub fn now(measurements: Vec<Measurement>) -> Self {
        let now = chrono::Utc::now();
        let timestamp = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
        Self::new(measurements, timestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
