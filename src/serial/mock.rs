//! Scripted serial devices for exercising the link, driver and supervisor
//! without hardware. Exposed unconditionally so integration tests can use it.
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, MutexGuard};

use super::interface::{PortOpener, SerialPortIO};
use super::{PortSettings, Result, SerialError};

/// What the device does in answer to the next command it receives
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with these bytes (include the terminator yourself)
    Line(String),
    /// Say nothing at all
    Silence,
    /// The write never completes
    WriteTimeout,
    /// The port vanished under us
    Disconnect,
}

#[derive(Debug, Default)]
struct DeviceState {
    replies: VecDeque<Reply>,
    input: VecDeque<u8>,
    sent: Vec<String>,
    opens: usize,
    failing_opens: usize,
}

/// Shared handle on one simulated device; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next command
    pub fn reply(&self, reply: Reply) -> &Self {
        self.lock().replies.push_back(reply);
        self
    }

    pub fn reply_line(&self, line: &str) -> &Self {
        self.reply(Reply::Line(line.to_string()))
    }

    /// Make the next `count` open attempts fail
    pub fn fail_opens(&self, count: usize) -> &Self {
        self.lock().failing_opens = count;
        self
    }

    /// Commands received so far, terminators included
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Successful open calls so far
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn pending_replies(&self) -> usize {
        self.lock().replies.len()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ScriptedPort {
    device: ScriptedDevice,
}

impl SerialPortIO for ScriptedPort {
    fn bytes_to_read(&mut self) -> std::io::Result<u32> {
        Ok(self.device.lock().input.len() as u32)
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        self.device.lock().input.clear();
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut state = self.device.lock();
        // A bare terminator is the priming write; real devices ignore it too
        if data.iter().all(|b| *b == b'\r' || *b == b'\n') {
            return Ok(());
        }
        state.sent.push(String::from_utf8_lossy(data).into_owned());
        match state.replies.pop_front().unwrap_or(Reply::Silence) {
            Reply::Line(line) => {
                state.input.extend(line.into_bytes());
                Ok(())
            }
            Reply::Silence => Ok(()),
            Reply::WriteTimeout => Err(ErrorKind::TimedOut.into()),
            Reply::Disconnect => Err(ErrorKind::BrokenPipe.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.device.lock();
        if state.input.is_empty() {
            return Err(ErrorKind::TimedOut.into());
        }
        let n = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Hands out scripted ports by device path
#[derive(Debug, Clone, Default)]
pub struct ScriptedOpener {
    devices: Arc<Mutex<HashMap<String, ScriptedDevice>>>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device at `path`, returning its handle
    pub fn attach(&self, path: &str) -> ScriptedDevice {
        let device = ScriptedDevice::new();
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_string(), device.clone());
        device
    }

    pub fn detach(&self, path: &str) {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(path);
    }
}

impl PortOpener for ScriptedOpener {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn SerialPortIO>> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&settings.path)
            .cloned()
            .ok_or_else(|| SerialError::ConnectionError {
                port: settings.path.clone(),
                reason: "no such device".to_string(),
            })?;

        {
            let mut state = device.lock();
            if state.failing_opens > 0 {
                state.failing_opens -= 1;
                return Err(SerialError::ConnectionError {
                    port: settings.path.clone(),
                    reason: "device busy".to_string(),
                });
            }
            state.opens += 1;
        }

        Ok(Box::new(ScriptedPort { device }))
    }
}
