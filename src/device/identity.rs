//! Stable device identities.
//!
//! Paths such as `/dev/ttyUSB0` are handed out in enumeration order and can
//! change across reboots or replugs, so persisted configuration refers to a
//! device by where it sits on the bus instead. On Linux that is the sysfs path
//! of the USB interface the tty hangs off (`/sys/devices/.../1-1.2:1.0`);
//! elsewhere it is built from the USB descriptors `serialport` reports.
use std::sync::{Arc, Mutex};
use serialport::SerialPortType;

use super::{DeviceError, Result};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::UdevTopology;

/// Prefixes that mark a path as already being a stable identifier
const STABLE_PREFIXES: [&str; 2] = ["/sys/", "usb:"];

/// A serial device currently attached to the board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPort {
    pub volatile_path: String,
    pub stable_id: String,
}

/// Source of the current bus topology
pub trait DeviceTopology: Send + Sync {
    fn attached_ports(&self) -> Result<Vec<AttachedPort>>;
}

/// Translates between volatile device paths and stable identifiers
pub struct IdentityResolver {
    topology: Box<dyn DeviceTopology>,
}

impl IdentityResolver {
    pub fn new(topology: Box<dyn DeviceTopology>) -> Self {
        Self { topology }
    }

    pub fn is_stable(path: &str) -> bool {
        STABLE_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
    }

    /// Stable identifier of the device currently at `volatile_path`
    pub fn to_stable_id(&self, volatile_path: &str) -> Result<String> {
        self.topology
            .attached_ports()?
            .into_iter()
            .find(|port| port.volatile_path == volatile_path)
            .map(|port| port.stable_id)
            .ok_or_else(|| DeviceError::DeviceNotFound(volatile_path.to_string()))
    }

    /// Current volatile path of the device identified by `stable_id`
    pub fn to_volatile_path(&self, stable_id: &str) -> Result<String> {
        self.topology
            .attached_ports()?
            .into_iter()
            .find(|port| port.stable_id == stable_id)
            .map(|port| port.volatile_path)
            .ok_or_else(|| DeviceError::DeviceNotFound(stable_id.to_string()))
    }

    /// Stable form of a configured path, and whether it had to be rewritten.
    pub fn normalize(&self, path: &str) -> Result<(String, bool)> {
        if Self::is_stable(path) {
            Ok((path.to_string(), false))
        } else {
            self.to_stable_id(path).map(|stable| (stable, true))
        }
    }
}

/// Platform topology source
pub fn default_topology() -> Box<dyn DeviceTopology> {
    #[cfg(target_os = "linux")]
    {
        Box::new(UdevTopology::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Box::new(SerialportTopology)
    }
}

/// Topology from the USB descriptors reported by `serialport`
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialportTopology;

impl DeviceTopology for SerialportTopology {
    fn attached_ports(&self) -> Result<Vec<AttachedPort>> {
        let ports = serialport::available_ports()
            .map_err(|e| DeviceError::Topology(e.to_string()))?;

        let mut attached = Vec::new();
        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                let serial = usb_info
                    .serial_number
                    .clone()
                    .unwrap_or_else(|| port.port_name.clone());
                attached.push(AttachedPort {
                    stable_id: format!("usb:{:04x}:{:04x}:{}", usb_info.vid, usb_info.pid, serial),
                    volatile_path: port.port_name,
                });
            }
        }
        Ok(attached)
    }
}

/// Fixed topology that can be re-enumerated by hand.
///
/// Used by tests to simulate devices moving between paths; also handy on
/// boards whose serial devices are not on USB.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    ports: Arc<Mutex<Vec<AttachedPort>>>,
}

impl StaticTopology {
    pub fn new(ports: &[(&str, &str)]) -> Self {
        let topology = Self::default();
        topology.set(ports);
        topology
    }

    /// Replace the whole topology with `(volatile_path, stable_id)` pairs
    pub fn set(&self, ports: &[(&str, &str)]) {
        let ports = ports
            .iter()
            .map(|(volatile, stable)| AttachedPort {
                volatile_path: volatile.to_string(),
                stable_id: stable.to_string(),
            })
            .collect();
        *self.ports.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = ports;
    }
}

impl DeviceTopology for StaticTopology {
    fn attached_ports(&self) -> Result<Vec<AttachedPort>> {
        Ok(self
            .ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }
}
