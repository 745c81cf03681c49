//! The polling loop and its terminal actions.
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::{BoardConfig, BoardIdentity, BoardStatus, ConfigError, ConfigReconciler, ConfigUpdate};
use crate::device::{CycleOutcome, DeviceError, DeviceManager, IdentityResolver};
use crate::logging::LogFile;
use crate::remote::{AggregatedReading, RemoteError, RemoteStore};
use crate::serial::{PortOpener, ReadCommand};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(RemoteError),

    #[error("Remote configuration record {0} was deleted")]
    RemoteRecordDeleted(String),

    #[error("Device not found: {0}; check connections, the configuration may be stale")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(ConfigError),

    #[error("Reboot failed: {0}")]
    Reboot(String),
}

impl From<RemoteError> for AgentError {
    fn from(error: RemoteError) -> Self {
        AgentError::RemoteUnavailable(error)
    }
}

impl From<DeviceError> for AgentError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::DeviceNotFound(id) => AgentError::DeviceNotFound(id),
            other => AgentError::Config(ConfigError::Device(other)),
        }
    }
}

impl From<ConfigError> for AgentError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::RemoteRecordDeleted(id) => AgentError::RemoteRecordDeleted(id),
            ConfigError::Remote(e) => AgentError::RemoteUnavailable(e),
            ConfigError::Device(e) => e.into(),
            other => AgentError::Config(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// The single way this agent restarts the board
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn reboot(&self) -> Result<()>;
}

/// Reboots the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPower;

#[async_trait]
impl PowerControl for SystemPower {
    async fn reboot(&self) -> Result<()> {
        log::warn!("Rebooting the board");
        let output = tokio::process::Command::new("sudo")
            .arg("reboot")
            .output()
            .await
            .map_err(|e| AgentError::Reboot(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(AgentError::Reboot(String::from_utf8_lossy(&output.stderr).into_owned()))
        }
    }
}

/// Counts reboot requests instead of acting on them
#[derive(Debug, Default, Clone)]
pub struct NoopPower {
    requests: Arc<AtomicUsize>,
}

impl NoopPower {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reboot_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowerControl for NoopPower {
    async fn reboot(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        log::warn!("Reboot requested, exiting instead");
        Ok(())
    }
}

/// What a completed cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// A reading with this many measurements was stored
    Inserted(usize),
    /// No sensor produced anything; carries the consecutive empty count
    Empty(u32),
    /// A device moved; drivers were rebuilt and the cycle abandoned
    Reloaded,
}

/// Why the polling loop ended
#[derive(Debug)]
pub enum Exit {
    /// Operator interrupt
    Stopped,
    /// Escalation from the recovery supervisor or the empty-cycle watchdog
    Reboot,
    Fatal(AgentError),
}

impl From<AgentError> for Exit {
    fn from(error: AgentError) -> Self {
        Exit::Fatal(error)
    }
}

/// Explicit context of one agent instance.
///
/// Configuration, drivers and stores are owned here and only changed by
/// the reconciler's and recovery supervisor's operations.
pub struct Agent {
    config: BoardConfig,
    reconciler: ConfigReconciler,
    identity: IdentityResolver,
    opener: Arc<dyn PortOpener>,
    power: Arc<dyn PowerControl>,
    log: LogFile,
    devices: Option<DeviceManager>,
    /// Read commands that cannot be expressed in the document, by sensor
    read_commands: Vec<(String, ReadCommand)>,
    empty_cycles: u32,
}

impl Agent {
    pub fn new(
        reconciler: ConfigReconciler,
        identity: IdentityResolver,
        opener: Arc<dyn PortOpener>,
        power: Arc<dyn PowerControl>,
        log: LogFile,
    ) -> Self {
        Self {
            config: BoardConfig::default(),
            reconciler,
            identity,
            opener,
            power,
            log,
            devices: None,
            read_commands: Vec::new(),
            empty_cycles: 0,
        }
    }

    /// Read sensor `name` with `command` instead of its configured one,
    /// across every rebuild.
    pub fn with_read_command(mut self, name: &str, command: ReadCommand) -> Self {
        self.read_commands.push((name.to_string(), command));
        self
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn devices(&self) -> Option<&DeviceManager> {
        self.devices.as_ref()
    }

    /// Reconcile configuration, build the drivers and report `Running`.
    pub async fn startup(&mut self, board: BoardIdentity) -> Result<()> {
        self.config = self.reconciler.initialize(&self.identity, board).await?;
        self.rebuild().await?;
        self.reconciler
            .publish_status(&mut self.config, BoardStatus::Running)
            .await?;
        log::info!("Reading started");
        Ok(())
    }

    /// One pass: check for a configuration edit, read every sensor, store
    /// the reading and upload the log.
    pub async fn run_cycle(&mut self) -> std::result::Result<CycleStatus, Exit> {
        match self.reconciler.check_for_update(&self.config).await.map_err(AgentError::from)? {
            ConfigUpdate::Unchanged => {}
            ConfigUpdate::Changed(newer) => {
                self.config = newer;
                self.reconciler
                    .normalize_paths(&mut self.config, &self.identity)
                    .await
                    .map_err(AgentError::from)?;
                self.rebuild().await?;
                self.reconciler
                    .publish_status(&mut self.config, BoardStatus::Running)
                    .await
                    .map_err(AgentError::from)?;
            }
            ConfigUpdate::Deleted => {
                let id = self.config.id.clone().unwrap_or_default();
                return Err(Exit::Fatal(AgentError::RemoteRecordDeleted(id)));
            }
        }

        let outcome = match self.devices.as_mut() {
            Some(devices) => devices.poll(&self.identity).await,
            None => CycleOutcome::Complete(Vec::new()),
        };

        let status = match outcome {
            CycleOutcome::Reboot => return Err(Exit::Reboot),
            CycleOutcome::Reload => {
                log::warn!("Reloading sensors");
                self.rebuild().await?;
                CycleStatus::Reloaded
            }
            CycleOutcome::Complete(measurements) if measurements.is_empty() => {
                self.empty_cycles += 1;
                log::warn!("Empty reading ({} in a row)", self.empty_cycles);
                let limit = self.config.settings.max_empty_cycles;
                if limit > 0 && self.empty_cycles >= limit {
                    log::error!("No measurements for {} cycles, escalating", self.empty_cycles);
                    return Err(Exit::Reboot);
                }
                CycleStatus::Empty(self.empty_cycles)
            }
            CycleOutcome::Complete(measurements) => {
                self.empty_cycles = 0;
                let count = measurements.len();
                let reading = AggregatedReading::now(measurements);
                log::info!("{}", serde_json::to_string(&reading).unwrap_or_default());
                self.reconciler
                    .remote()
                    .insert_reading(&reading)
                    .await
                    .map_err(AgentError::from)?;
                CycleStatus::Inserted(count)
            }
        };

        self.upload_log(self.reconciler.remote()).await;
        Ok(status)
    }

    /// Poll until `shutdown` resolves or a cycle ends the loop.
    pub async fn run<F>(&mut self, shutdown: F) -> Exit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let started = Instant::now();
            let cycle = tokio::select! {
                _ = &mut shutdown => return Exit::Stopped,
                cycle = self.run_cycle() => cycle,
            };
            if let Err(exit) = cycle {
                return exit;
            }

            let interval = self.config.settings.reading_interval();
            let elapsed = started.elapsed();
            if elapsed >= interval {
                log::warn!(
                    "Running at {:.1} s per reading, slower than the {:.1} s interval",
                    elapsed.as_secs_f64(),
                    interval.as_secs_f64()
                );
                continue;
            }

            tokio::select! {
                _ = &mut shutdown => return Exit::Stopped,
                _ = tokio::time::sleep(interval - elapsed) => {}
            }
        }
    }

    /// Carry out the terminal action for `exit`: record the final status and
    /// upload the log with one attempt each, then act on the exit.
    pub async fn finish(&mut self, exit: Exit) -> Result<()> {
        if let Some(devices) = self.devices.as_mut() {
            devices.close_all();
        }

        match exit {
            Exit::Stopped => {
                log::info!("Stopping on operator request");
                self.record_final_status(BoardStatus::Stopped).await;
                self.upload_log(self.reconciler.direct()).await;
                Ok(())
            }
            Exit::Reboot => {
                self.record_final_status(BoardStatus::Exception).await;
                self.upload_log(self.reconciler.direct()).await;
                self.power.reboot().await
            }
            Exit::Fatal(error) => {
                log::error!("{}", error);
                self.record_final_status(BoardStatus::Exception).await;
                self.upload_log(self.reconciler.direct()).await;
                Err(error)
            }
        }
    }

    async fn rebuild(&mut self) -> Result<()> {
        if let Some(mut devices) = self.devices.take() {
            devices.close_all();
        }

        let mut devices = DeviceManager::build(
            &self.config.sensors,
            &self.identity,
            self.opener.clone(),
            self.config.settings.recovery.clone(),
        )
        .await?;
        for (name, command) in &self.read_commands {
            if !devices.set_read_command(name, command.clone()) {
                log::warn!("No sensor {} to install a read command on", name);
            }
        }

        for driver in devices.drivers() {
            log::info!("Sensor {} @ {}", driver.name(), driver.port_name());
        }
        self.devices = Some(devices);
        self.empty_cycles = 0;
        Ok(())
    }

    async fn record_final_status(&mut self, status: BoardStatus) {
        if self.config.id.is_none() {
            return;
        }
        if let Err(e) = self.reconciler.publish_final_status(&mut self.config, status).await {
            log::warn!("Could not record final status {}: {}", status, e);
        }
    }

    /// Best effort: failures are logged, never fatal.
    async fn upload_log(&self, store: &Arc<dyn RemoteStore>) {
        let Some(id) = self.config.id.as_deref() else {
            return;
        };
        let contents = match self.log.contents().await {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!("Could not read log file {}: {}", self.log.path().display(), e);
                return;
            }
        };
        if let Err(e) = store.upload_log(id, &contents).await {
            log::warn!("Log upload failed: {}", e);
        }
    }
}
