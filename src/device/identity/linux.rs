use std::path::{Path, PathBuf};
use libudev::{Context, Enumerator};

use super::{AttachedPort, DeviceTopology};
use crate::device::{DeviceError, Result};

/// Topology read from udev and sysfs
#[derive(Debug, Clone)]
pub struct UdevTopology {
    sysfs_root: PathBuf,
}

impl UdevTopology {
    pub fn new() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
        }
    }

    fn stable_id(&self, sysname: &str) -> Option<String> {
        let class_link = self.sysfs_root.join("class/tty").join(sysname);
        let resolved = std::fs::canonicalize(&class_link).ok()?;
        stable_id_from_syspath(&resolved)
    }
}

impl Default for UdevTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTopology for UdevTopology {
    fn attached_ports(&self) -> Result<Vec<AttachedPort>> {
        let context = Context::new().map_err(|e| DeviceError::Topology(e.to_string()))?;
        let mut enumerator =
            Enumerator::new(&context).map_err(|e| DeviceError::Topology(e.to_string()))?;
        enumerator
            .match_subsystem("tty")
            .map_err(|e| DeviceError::Topology(e.to_string()))?;
        let devices = enumerator
            .scan_devices()
            .map_err(|e| DeviceError::Topology(e.to_string()))?;

        let mut attached = Vec::new();
        for device in devices {
            let devnode = match device.devnode().and_then(|node| node.to_str()) {
                Some(node) => node.to_string(),
                None => continue,
            };
            let sysname = match device.sysname().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if let Some(stable_id) = self.stable_id(&sysname) {
                log::debug!("{} is attached at {}", devnode, stable_id);
                attached.push(AttachedPort {
                    volatile_path: devnode,
                    stable_id,
                });
            }
        }

        Ok(attached)
    }
}

/// Cut a tty's sysfs path down to the bus location of its parent device.
///
/// `/sys/devices/.../1-1.2:1.0/ttyUSB0/tty/ttyUSB0` becomes
/// `/sys/devices/.../1-1.2:1.0`. Virtual terminals have no bus location.
pub fn stable_id_from_syspath(syspath: &Path) -> Option<String> {
    let path = syspath.to_str()?;
    if path.contains("/devices/virtual/") {
        return None;
    }
    let cut = path.find("/tty")?;
    let stable = &path[..cut];
    if stable.starts_with("/sys/") {
        Some(stable.to_string())
    } else {
        None
    }
}
