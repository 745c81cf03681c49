use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use super::{SensorFault, SerialError, SerialInterface};

/// Command sent to the device to request one reading
#[derive(Clone)]
pub enum ReadCommand {
    Literal(String),
    /// Built fresh for every read, e.g. a temperature-compensated query
    Generated(Arc<dyn Fn() -> String + Send + Sync>),
}

impl ReadCommand {
    pub fn resolve(&self) -> String {
        match self {
            ReadCommand::Literal(command) => command.clone(),
            ReadCommand::Generated(generate) => generate(),
        }
    }
}

impl fmt::Debug for ReadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadCommand::Literal(command) => f.debug_tuple("Literal").field(command).finish(),
            ReadCommand::Generated(_) => f.write_str("Generated(..)"),
        }
    }
}

/// One named value produced by a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Line-oriented measurement device driver.
///
/// Wraps one [`SerialInterface`] with a name/unit/command contract: send the
/// read command, wait for the device to settle, read one line and turn its
/// comma-separated numbers into named measurements.
pub struct SensorDriver {
    name: String,
    names: Vec<String>,
    units: Vec<String>,
    command: ReadCommand,
    wait_time: Duration,
    interface: SerialInterface,
    enabled: bool,
    last_line: String,
}

impl SensorDriver {
    /// `names` and `units` are comma-separated lists such as `"Temp,Humidity"`.
    pub fn new(
        names: &str,
        units: &str,
        command: ReadCommand,
        wait_time: Duration,
        interface: SerialInterface,
    ) -> Self {
        let name: String = names.chars().filter(|c| !c.is_whitespace()).collect();
        let units: String = units.chars().filter(|c| !c.is_whitespace()).collect();
        Self {
            names: split_list(&name),
            units: split_list(&units),
            name,
            command,
            wait_time,
            interface,
            enabled: true,
            last_line: String::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port_name(&self) -> &str {
        self.interface.port_name()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Last line read from the device, terminator excluded
    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    /// Replace the command sent for each reading
    pub fn set_command(&mut self, command: ReadCommand) {
        self.command = command;
    }

    pub fn interface_mut(&mut self) -> &mut SerialInterface {
        &mut self.interface
    }

    /// Close and reopen the link, priming it again.
    pub async fn reopen(&mut self) -> Result<(), SensorFault> {
        self.interface.close();
        let opened = self.interface.open().await;
        opened.map_err(|e| self.fault(e))
    }

    /// Send a command without expecting an answer
    pub async fn send(&mut self, command: &str) -> Result<(), SensorFault> {
        let sent = self.interface.send(command).await;
        sent.map_err(|e| self.fault(e))
    }

    /// Take one reading.
    ///
    /// An answer without any numeric token is an empty reading, not an error.
    pub async fn read(&mut self) -> Result<Vec<Measurement>, SensorFault> {
        let command = self.command.resolve();
        self.send(&command).await?;
        tokio::time::sleep(self.wait_time).await;

        let line = match self.interface.read_line().await {
            Ok(line) => line,
            Err(e) => return Err(self.fault(e)),
        };
        self.last_line = line;

        let values = parse_values(&self.last_line).map_err(|token| {
            self.fault(SerialError::InvalidDataType {
                port: self.interface.port_name().to_string(),
                token,
                raw_line: self.last_line.clone(),
            })
        })?;

        Ok(pair_measurements(&self.names, &self.units, &values))
    }

    fn fault(&self, error: SerialError) -> SensorFault {
        SensorFault {
            sensor: self.name.clone(),
            error,
        }
    }
}

fn split_list(list: &str) -> Vec<String> {
    if list.is_empty() {
        return Vec::new();
    }
    list.split(',').map(str::to_string).collect()
}

/// Parse a comma-separated line of floats, whitespace ignored.
///
/// Returns the offending token when one does not parse.
pub fn parse_values(line: &str) -> Result<Vec<f64>, String> {
    let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Ok(Vec::new());
    }
    compact
        .split(',')
        .map(|token| token.parse::<f64>().map_err(|_| token.to_string()))
        .collect()
}

/// Zip names, units and values in order, stopping at the shortest.
///
/// Mismatched lengths are tolerated: extra names, units or values are dropped.
pub fn pair_measurements(names: &[String], units: &[String], values: &[f64]) -> Vec<Measurement> {
    names
        .iter()
        .zip(units.iter())
        .zip(values.iter())
        .map(|((name, unit), value)| Measurement {
            name: name.clone(),
            value: *value,
            unit: unit.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pairing_stops_at_the_shortest_sequence() {
        let names = list(&["Temp", "Humidity", "CO2"]);
        let units = list(&["C", "RH"]);
        let values = [21.4, 55.2, 443.0];
        let paired = pair_measurements(&names, &units, &values);
        assert_eq!(paired.len(), 2);
        assert_eq!(paired[1].name, "Humidity");
        assert_eq!(paired[1].unit, "RH");
        assert_eq!(paired[1].value, 55.2);

        for (n, u, v) in [(3usize, 3usize, 1usize), (1, 3, 3), (0, 2, 2), (4, 4, 4)] {
            let names: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
            let units: Vec<String> = (0..u).map(|i| format!("u{}", i)).collect();
            let values: Vec<f64> = (0..v).map(|i| i as f64).collect();
            let paired = pair_measurements(&names, &units, &values);
            assert_eq!(paired.len(), n.min(u).min(v));
            for (i, m) in paired.iter().enumerate() {
                assert_eq!(m.name, format!("n{}", i));
                assert_eq!(m.unit, format!("u{}", i));
                assert_eq!(m.value, i as f64);
            }
        }
    }

    #[test]
    fn parse_values_strips_whitespace() {
        assert_eq!(parse_values(" 21.4, 55.2 ").unwrap(), vec![21.4, 55.2]);
        assert_eq!(parse_values("").unwrap(), Vec::<f64>::new());
        assert_eq!(parse_values("  ").unwrap(), Vec::<f64>::new());
        assert_eq!(parse_values("6.8,*OK").unwrap_err(), "*OK");
        assert_eq!(parse_values("1.0,").unwrap_err(), "");
    }

    #[test]
    fn generated_commands_are_resolved_per_call() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let command = ReadCommand::Generated(Arc::new(move || {
            let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("R{}", n)
        }));
        assert_eq!(command.resolve(), "R0");
        assert_eq!(command.resolve(), "R1");
        assert_eq!(ReadCommand::Literal("R".into()).resolve(), "R");
    }
}
