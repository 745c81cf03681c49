pub mod identity;
pub mod manager;
pub mod recovery;

pub use identity::{default_topology, AttachedPort, DeviceTopology, IdentityResolver, StaticTopology};
pub use manager::{CycleOutcome, DeviceManager};
pub use recovery::{Recovery, RecoveryPolicy, RecoverySupervisor};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found: {0} (check wiring, configuration may be stale)")]
    DeviceNotFound(String),

    #[error("Could not enumerate serial devices: {0}")]
    Topology(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
