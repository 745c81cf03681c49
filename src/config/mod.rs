pub mod models;
pub mod reconciler;
pub mod store;

pub use models::{
    AgentSettings, BoardConfig, BoardIdentity, BoardStatus, RemoteSettings, SensorDefinition,
};
pub use reconciler::{ConfigReconciler, ConfigUpdate, ReconcileState};
pub use store::LocalConfigStore;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file {0} not found; run the setup tool first")]
    Missing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration has no remote record id yet")]
    Unassigned,

    #[error("Remote configuration record {0} was deleted")]
    RemoteRecordDeleted(String),

    #[error("Device error: {0}")]
    Device(#[from] crate::device::DeviceError),

    #[error("Remote store error: {0}")]
    Remote(#[from] crate::remote::RemoteError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
