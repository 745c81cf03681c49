use std::time::Duration;
use serde::{Deserialize, Serialize};

use super::{DeviceError, IdentityResolver};
use crate::serial::{FaultClass, Measurement, SensorDriver, SensorFault};

/// Retry budgets for in-cycle serial recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Reopen-and-read attempts for link faults before escalating
    pub transport_retries: u32,
    /// Read attempts for unparseable answers before disabling the sensor
    pub parse_retries: u32,
    pub parse_backoff_ms: u64,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            transport_retries: 3,
            parse_retries: 3,
            parse_backoff_ms: 3000,
        }
    }
}

/// Result of handling one sensor fault
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// A retry succeeded; the cycle continues with these measurements
    Recovered(Vec<Measurement>),
    /// The sensor kept sending garbage and is now excluded from polling
    SensorDisabled,
    /// The device came back under another path; rebuild all drivers
    ReloadSensors,
    /// Nothing left to try short of restarting the board
    RebootDevice,
}

/// Fault state machine for a single sensor.
///
/// Every path through [`recover`](Self::recover) is bounded by the policy's
/// budgets, so a cycle always either makes progress or escalates.
#[derive(Debug, Clone, Default)]
pub struct RecoverySupervisor {
    policy: RecoveryPolicy,
}

impl RecoverySupervisor {
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    /// Handle `fault` raised by `driver`, retrying as the fault class allows.
    ///
    /// `stable_id` is the identity the driver was bound from; it decides
    /// between reloading and rebooting once link retries run out.
    pub async fn recover(
        &self,
        driver: &mut SensorDriver,
        fault: SensorFault,
        identity: &IdentityResolver,
        stable_id: &str,
    ) -> Recovery {
        let mut fault = fault;
        let mut transport_attempts = 0;
        let mut parse_attempts = 0;

        loop {
            log::error!("{}", fault);

            match fault.error.class() {
                FaultClass::Unknown => {
                    log::error!("Unclassified fault on sensor {}, escalating", driver.name());
                    return Recovery::RebootDevice;
                }
                FaultClass::Transport => {
                    if transport_attempts >= self.policy.transport_retries {
                        return self.escalate_link_fault(driver, identity, stable_id);
                    }
                    transport_attempts += 1;
                    log::warn!(
                        "Repairing connection to sensor {} on {} (attempt {}/{})",
                        driver.name(),
                        driver.port_name(),
                        transport_attempts,
                        self.policy.transport_retries
                    );
                    if let Err(e) = driver.reopen().await {
                        fault = e;
                        continue;
                    }
                }
                FaultClass::Parse => {
                    if parse_attempts >= self.policy.parse_retries {
                        driver.enable(false);
                        log::error!(
                            "Disabling sensor {} after {} unreadable answers (last line {:?})",
                            driver.name(),
                            parse_attempts + 1,
                            driver.last_line()
                        );
                        return Recovery::SensorDisabled;
                    }
                    parse_attempts += 1;
                    log::warn!(
                        "Retrying read of sensor {} (attempt {}/{})",
                        driver.name(),
                        parse_attempts,
                        self.policy.parse_retries
                    );
                    tokio::time::sleep(Duration::from_millis(self.policy.parse_backoff_ms)).await;
                }
            }

            match driver.read().await {
                Ok(measurements) => {
                    log::info!("Sensor {} recovered", driver.name());
                    return Recovery::Recovered(measurements);
                }
                Err(e) => fault = e,
            }
        }
    }

    fn escalate_link_fault(
        &self,
        driver: &SensorDriver,
        identity: &IdentityResolver,
        stable_id: &str,
    ) -> Recovery {
        match identity.to_volatile_path(stable_id) {
            Ok(current) if current != driver.port_name() => {
                log::warn!(
                    "Sensor {} moved from {} to {}, reloading sensors",
                    driver.name(),
                    driver.port_name(),
                    current
                );
                Recovery::ReloadSensors
            }
            Ok(_) => {
                log::error!(
                    "Sensor {} is still attached at {} but does not answer, rebooting",
                    driver.name(),
                    driver.port_name()
                );
                Recovery::RebootDevice
            }
            Err(DeviceError::DeviceNotFound(id)) => {
                log::error!(
                    "Sensor {} is gone ({} no longer resolves), check wiring; rebooting",
                    driver.name(),
                    id
                );
                Recovery::RebootDevice
            }
            Err(e) => {
                log::error!("Could not re-resolve sensor {}: {}", driver.name(), e);
                Recovery::RebootDevice
            }
        }
    }
}
