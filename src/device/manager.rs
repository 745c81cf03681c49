use std::sync::Arc;

use super::{IdentityResolver, Recovery, RecoveryPolicy, RecoverySupervisor, Result};
use crate::config::SensorDefinition;
use crate::serial::{Measurement, PortOpener, ReadCommand, SensorDriver, SerialInterface};

/// How one polling pass over all sensors ended
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Every enabled sensor was read or dealt with
    Complete(Vec<Measurement>),
    /// Abort the cycle and rebuild drivers from configuration
    Reload,
    /// Abort the cycle and restart the board
    Reboot,
}

struct BoundSensor {
    driver: SensorDriver,
    stable_id: String,
}

/// Owns the measurement drivers built from the current configuration
/// and reads them one at a time.
pub struct DeviceManager {
    sensors: Vec<BoundSensor>,
    supervisor: RecoverySupervisor,
}

impl DeviceManager {
    /// Bind every definition to the device currently at its stable identity
    /// and open the links.
    ///
    /// Fails with `DeviceNotFound` when a configured device is not attached.
    /// A device that is attached but refuses to open is only logged; its
    /// first read goes through the normal recovery path.
    pub async fn build(
        definitions: &[SensorDefinition],
        identity: &IdentityResolver,
        opener: Arc<dyn PortOpener>,
        policy: RecoveryPolicy,
    ) -> Result<Self> {
        let mut sensors = Vec::with_capacity(definitions.len());

        for definition in definitions {
            let (stable_id, _) = identity.normalize(&definition.path)?;
            let volatile_path = identity.to_volatile_path(&stable_id)?;
            log::info!("Binding sensor {} to {} ({})", definition.name, volatile_path, stable_id);

            let interface = SerialInterface::new(definition.port_settings(&volatile_path), opener.clone());
            let mut driver = SensorDriver::new(
                &definition.name,
                &definition.units,
                definition.read_command(),
                definition.wait_time(),
                interface,
            );

            match driver.reopen().await {
                Ok(()) => {
                    for command in &definition.init_commands {
                        if let Err(e) = driver.send(command).await {
                            log::warn!("Init command {:?} failed: {}", command, e);
                        }
                    }
                }
                Err(e) => log::error!("{}; will retry on first read", e),
            }

            sensors.push(BoundSensor { driver, stable_id });
        }

        Ok(Self {
            sensors,
            supervisor: RecoverySupervisor::new(policy),
        })
    }

    /// Read every enabled sensor once, in configuration order.
    pub async fn poll(&mut self, identity: &IdentityResolver) -> CycleOutcome {
        let mut measurements = Vec::new();

        for sensor in self.sensors.iter_mut() {
            if !sensor.driver.is_enabled() {
                continue;
            }

            let fault = match sensor.driver.read().await {
                Ok(values) => {
                    measurements.extend(values);
                    continue;
                }
                Err(fault) => fault,
            };

            let recovery = self
                .supervisor
                .recover(&mut sensor.driver, fault, identity, &sensor.stable_id)
                .await;
            match recovery {
                Recovery::Recovered(values) => measurements.extend(values),
                Recovery::SensorDisabled => {}
                Recovery::ReloadSensors => return CycleOutcome::Reload,
                Recovery::RebootDevice => return CycleOutcome::Reboot,
            }
        }

        CycleOutcome::Complete(measurements)
    }

    /// Close every link; drivers stay configured.
    pub fn close_all(&mut self) {
        for sensor in self.sensors.iter_mut() {
            sensor.driver.interface_mut().close();
        }
    }

    pub fn drivers(&self) -> impl Iterator<Item = &SensorDriver> {
        self.sensors.iter().map(|sensor| &sensor.driver)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Install `command` on the sensor configured as `name`.
    ///
    /// Returns false when no such sensor is bound.
    pub fn set_read_command(&mut self, name: &str, command: ReadCommand) -> bool {
        let wanted: String = name.chars().filter(|c| !c.is_whitespace()).collect();
        match self.sensors.iter_mut().find(|sensor| sensor.driver.name() == wanted) {
            Some(sensor) => {
                sensor.driver.set_command(command);
                true
            }
            None => false,
        }
    }
}
