use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use serialport::{DataBits, SerialPort, StopBits};

use super::{Parity, PortSettings, Result, SerialError};

/// Longest line accepted before the response is treated as garbage
const MAX_LINE_LEN: usize = 1024;
/// Time given to the device to answer the priming terminator
const PRIME_SETTLE: Duration = Duration::from_millis(300);
const PRIME_FLUSH_SETTLE: Duration = Duration::from_millis(100);

/// Byte-level operations a device link needs from an open port.
pub trait SerialPortIO: Send {
    /// Number of bytes waiting in the input buffer
    fn bytes_to_read(&mut self) -> std::io::Result<u32>;

    /// Discard everything waiting in the input buffer
    fn clear_input(&mut self) -> std::io::Result<()>;

    /// Write the whole buffer within the write deadline
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Blocking read bounded by the read deadline
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Opens ports for a device link; swapped for a scripted device in tests.
pub trait PortOpener: Send + Sync {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn SerialPortIO>>;
}

/// Real serial ports through the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    fn open(&self, settings: &PortSettings) -> Result<Box<dyn SerialPortIO>> {
        let data_bits = match settings.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = if settings.stop_bits == 2 { StopBits::Two } else { StopBits::One };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(settings.path.as_str(), settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .timeout(settings.read_timeout)
            .open()
            .map_err(|e| SerialError::from_serialport(&settings.path, e))?;

        Ok(Box::new(NativePort {
            port,
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
        }))
    }
}

/// `serialport` only carries one timeout, so writes swap in the write deadline.
struct NativePort {
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl SerialPortIO for NativePort {
    fn bytes_to_read(&mut self) -> std::io::Result<u32> {
        self.port.bytes_to_read().map_err(std::io::Error::from)
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(std::io::Error::from)
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.port.set_timeout(self.write_timeout).map_err(std::io::Error::from)?;
        let written = self.port.write_all(data).and_then(|_| self.port.flush());
        self.port.set_timeout(self.read_timeout).map_err(std::io::Error::from)?;
        written
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

/// One line-oriented serial connection.
///
/// Knows nothing about measurements: it frames outgoing commands with a
/// carriage return and deframes incoming bytes up to the first CR or LF.
pub struct SerialInterface {
    settings: PortSettings,
    opener: Arc<dyn PortOpener>,
    port: Option<Box<dyn SerialPortIO>>,
    last_error: Option<String>,
}

impl SerialInterface {
    /// Create a closed link; call [`open`](Self::open) to connect.
    pub fn new(settings: PortSettings, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            settings,
            opener,
            port: None,
            last_error: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.settings.path
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Open the port and prime it. Does nothing when already open.
    pub async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = match self.opener.open(&self.settings) {
            Ok(port) => port,
            Err(e) => return Err(self.record(e)),
        };
        self.port = Some(port);

        if let Err(e) = self.prime().await {
            self.port = None;
            return Err(self.record(e));
        }

        log::info!("Opened serial device on {}", self.settings.path);
        Ok(())
    }

    /// Close the port. Does nothing when already closed.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed serial device on {}", self.settings.path);
        }
    }

    /// Devices often read their first command as an error; a lone terminator
    /// followed by an input flush clears whatever they emitted on power-up.
    async fn prime(&mut self) -> Result<()> {
        let path = self.settings.path.clone();
        let port = self.port.as_mut().ok_or_else(|| not_open(&path))?;
        port.write_all(b"\r").map_err(|e| write_error(&path, e))?;
        tokio::time::sleep(PRIME_SETTLE).await;
        port.clear_input().map_err(|e| SerialError::from_io(&path, e))?;
        port.clear_input().map_err(|e| SerialError::from_io(&path, e))?;
        tokio::time::sleep(PRIME_FLUSH_SETTLE).await;
        Ok(())
    }

    /// Send a command, appending CR when it carries no line ending.
    ///
    /// Stale input is flushed right before writing so a late partial answer to
    /// the previous command cannot be read as the answer to this one.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        let path = self.settings.path.clone();
        let framed = frame_command(command);

        let result = match self.port.as_mut() {
            None => Err(not_open(&path)),
            Some(port) => port
                .clear_input()
                .map_err(|e| SerialError::from_io(&path, e))
                .and_then(|_| port.write_all(framed.as_bytes()).map_err(|e| write_error(&path, e))),
        };

        result.map_err(|e| self.record(e))?;
        log::debug!("Sent {:?} to {}", framed, path);
        Ok(())
    }

    /// Read one line, terminator excluded.
    ///
    /// Fails with `NoData` when nothing is buffered at the first check, and
    /// with `CorruptData` when bytes arrive but the read deadline passes
    /// before a CR or LF shows up.
    pub async fn read_line(&mut self) -> Result<String> {
        let path = self.settings.path.clone();
        let result = match self.port.as_mut() {
            None => Err(not_open(&path)),
            Some(port) => read_terminated(port.as_mut(), &path),
        };

        let line = result.map_err(|e| self.record(e))?;
        log::debug!("Read {:?} from {}", line, path);
        Ok(line)
    }

    fn record(&mut self, error: SerialError) -> SerialError {
        self.last_error = Some(error.to_string());
        error
    }
}

fn read_terminated(port: &mut dyn SerialPortIO, path: &str) -> Result<String> {
    let waiting = port.bytes_to_read().map_err(|e| SerialError::from_io(path, e))?;
    if waiting == 0 {
        return Err(SerialError::NoData { port: path.to_string() });
    }

    let mut line: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 64];
    loop {
        match port.read(&mut buffer) {
            Ok(0) => return Err(corrupt(path, &line)),
            Ok(n) => {
                let chunk = &buffer[..n];
                if let Some(end) = chunk.iter().position(|b| *b == b'\r' || *b == b'\n') {
                    line.extend_from_slice(&chunk[..end]);
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                line.extend_from_slice(chunk);
                if line.len() > MAX_LINE_LEN {
                    return Err(corrupt(path, &line));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => return Err(corrupt(path, &line)),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SerialError::from_io(path, e)),
        }
    }
}

/// Append CR unless the command already ends with CR or LF.
pub fn frame_command(command: &str) -> String {
    if command.ends_with('\r') || command.ends_with('\n') {
        command.to_string()
    } else {
        format!("{}\r", command)
    }
}

fn not_open(path: &str) -> SerialError {
    SerialError::ConnectionError {
        port: path.to_string(),
        reason: "connection closed".to_string(),
    }
}

fn write_error(path: &str, error: std::io::Error) -> SerialError {
    if error.kind() == std::io::ErrorKind::TimedOut {
        SerialError::WriteTimeout { port: path.to_string() }
    } else {
        SerialError::from_io(path, error)
    }
}

fn corrupt(path: &str, partial: &[u8]) -> SerialError {
    SerialError::CorruptData {
        port: path.to_string(),
        partial: String::from_utf8_lossy(partial).into_owned(),
    }
}
