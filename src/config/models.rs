use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::RecoveryPolicy;
use crate::serial::{Parity, PortSettings, ReadCommand};

/// Operational status shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoardStatus {
    /// Seeded but not yet configured by an operator
    #[default]
    Uninitialized,
    Running,
    Stopped,
    Exception,
}

impl std::fmt::Display for BoardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BoardStatus::Uninitialized => "Uninitialized",
            BoardStatus::Running => "Running",
            BoardStatus::Stopped => "Stopped",
            BoardStatus::Exception => "Exception",
        };
        f.write_str(name)
    }
}

/// Who the board is on the network
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardIdentity {
    pub hostname: String,
    pub ip: String,
    pub version: String,
}

impl BoardIdentity {
    /// Identity of the machine we are running on
    pub fn detect() -> Self {
        let ip = if_addrs::get_if_addrs()
            .ok()
            .and_then(|addrs| {
                addrs.into_iter().find_map(|addr| match addr.addr {
                    if_addrs::IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip.to_string()),
                    _ => None,
                })
            })
            .unwrap_or_else(|| "127.0.0.1".to_string());

        Self {
            hostname: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
            ip,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Agent timing and retry knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Period of one read-all/persist cycle
    pub reading_interval_secs: f64,
    /// How often a freshly seeded board checks for the operator's edit
    pub operator_poll_secs: u64,
    pub remote_retry_attempts: u32,
    pub remote_retry_interval_secs: u64,
    /// Consecutive cycles without any measurement before rebooting
    pub max_empty_cycles: u32,
    pub recovery: RecoveryPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            reading_interval_secs: 60.0,
            operator_poll_secs: 30,
            remote_retry_attempts: 360,
            remote_retry_interval_secs: 10,
            max_empty_cycles: 3,
            recovery: RecoveryPolicy::default(),
        }
    }
}

/// Longest accepted reading interval, one day
pub const MAX_READING_INTERVAL_SECS: f64 = 86_400.0;

impl AgentSettings {
    /// Reject values an operator edit could carry that no loop can honor.
    pub fn validate(&self) -> Result<(), String> {
        let secs = self.reading_interval_secs;
        if !secs.is_finite() || !(0.0..=MAX_READING_INTERVAL_SECS).contains(&secs) {
            return Err(format!(
                "reading_interval_secs must be between 0 and {}, got {}",
                MAX_READING_INTERVAL_SECS, secs
            ));
        }
        Ok(())
    }

    /// Clamped to `0..=MAX_READING_INTERVAL_SECS`; NaN reads as zero.
    pub fn reading_interval(&self) -> Duration {
        let secs = self.reading_interval_secs.clamp(0.0, MAX_READING_INTERVAL_SECS);
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }

    pub fn operator_poll(&self) -> Duration {
        Duration::from_secs(self.operator_poll_secs)
    }

    pub fn remote_retry_interval(&self) -> Duration {
        Duration::from_secs(self.remote_retry_interval_secs)
    }
}

/// Where telemetry and configuration records live
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub server: String,
    pub db_name: String,
    pub collection_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// One serial measurement device as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDefinition {
    /// Comma-separated measurement names, e.g. `Temp,Humidity`
    pub name: String,
    /// Comma-separated units, parallel to `name`
    pub units: String,
    /// Stable identifier, or a volatile path until normalized
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Settle time between command and answer
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_read_command")]
    pub read_command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_commands: Vec<String>,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_wait_time_ms() -> u64 {
    1000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_read_command() -> String {
    "R".to_string()
}

impl SensorDefinition {
    /// Definition with serial defaults (9600 8N1, `R` read command)
    pub fn new(name: &str, units: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            units: units.to_string(),
            path: path.to_string(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            wait_time_ms: default_wait_time_ms(),
            timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            read_command: default_read_command(),
            init_commands: Vec::new(),
        }
    }

    pub fn port_settings(&self, volatile_path: &str) -> PortSettings {
        PortSettings {
            path: volatile_path.to_string(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
            read_timeout: Duration::from_millis(self.timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }

    /// The configured command. Generated commands cannot be written in the
    /// document; install them with `DeviceManager::set_read_command`.
    pub fn read_command(&self) -> ReadCommand {
        ReadCommand::Literal(self.read_command.clone())
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

/// The configuration document, mirrored between the local file and the
/// remote store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Remote record id; absent until the document is first pushed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub board: BoardIdentity,
    #[serde(default)]
    pub status: BoardStatus,
    /// Bumped by operator edits only; unset means nobody claimed the board
    #[serde(default, with = "timestamp")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settings: AgentSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub sensors: Vec<SensorDefinition>,
    /// Fields this agent does not know about, written back untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BoardConfig {
    pub fn is_claimed(&self) -> bool {
        self.last_modified.is_some()
    }

    /// Whether `other` carries a strictly newer operator edit
    pub fn is_superseded_by(&self, other: &BoardConfig) -> bool {
        match (self.last_modified, other.last_modified) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(mine), Some(theirs)) => theirs > mine,
        }
    }
}

/// RFC 3339 timestamps where an empty string means "unset"
mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => DateTime::parse_from_rfc3339(text)
                .map(|ts| Some(ts.with_timezone(&Utc)))
                .map_err(serde::de::Error::custom),
        }
    }
}
