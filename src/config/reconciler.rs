//! Keeps the local configuration file and the remote record convergent.
//!
//! The document carrying the strictly newer `last_modified` wins wholesale.
//! A document nobody has edited yet (`last_modified` unset) is only ever
//! pushed, never pulled, and the agent waits for an operator to claim it.
use std::sync::Arc;
use uuid::Uuid;

use super::{BoardConfig, BoardIdentity, BoardStatus, ConfigError, LocalConfigStore, Result};
use crate::device::IdentityResolver;
use crate::remote::RemoteStore;

/// Where the local and remote documents stand relative to each other
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    /// No remote record exists yet
    Uninitialized,
    /// The local document is the seed record, waiting for an operator edit
    Pushed,
    /// Both sides carry the same edit
    Converged,
    /// The remote record carries a newer edit
    Diverged,
    /// The remote record of a claimed board vanished
    Deleted,
}

/// Result of a per-cycle update check
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigUpdate {
    Unchanged,
    /// A newer remote document, already written to the local file
    Changed(BoardConfig),
    Deleted,
}

/// Compare the local document with the remote record, if any.
pub fn classify(local: &BoardConfig, remote: Option<&BoardConfig>) -> ReconcileState {
    match remote {
        None if local.is_claimed() => ReconcileState::Deleted,
        None => ReconcileState::Uninitialized,
        Some(remote) if local.is_superseded_by(remote) => ReconcileState::Diverged,
        Some(remote) if !local.is_claimed() && !remote.is_claimed() => ReconcileState::Pushed,
        Some(_) => ReconcileState::Converged,
    }
}

pub struct ConfigReconciler {
    local: LocalConfigStore,
    remote: Arc<dyn RemoteStore>,
    /// Single-attempt store for writes made on the way out
    direct: Arc<dyn RemoteStore>,
}

impl ConfigReconciler {
    pub fn new(local: LocalConfigStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            direct: remote.clone(),
            remote,
        }
    }

    /// Use `store` without retries for the final status and log flush.
    pub fn with_direct_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.direct = store;
        self
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn direct(&self) -> &Arc<dyn RemoteStore> {
        &self.direct
    }

    /// Load the local document and bring it in line with the remote record,
    /// waiting for an operator edit when the board is not yet claimed.
    pub async fn initialize(
        &self,
        identity: &IdentityResolver,
        board: BoardIdentity,
    ) -> Result<BoardConfig> {
        let mut config = self.local.load().await?;
        config.board = board;

        loop {
            match self.reconcile(&mut config).await? {
                ReconcileState::Converged | ReconcileState::Diverged => break,
                ReconcileState::Uninitialized if config.is_claimed() => break,
                ReconcileState::Uninitialized | ReconcileState::Pushed => {
                    log::info!(
                        "Board {} is waiting for an operator update, checking again in {}s",
                        config.id.as_deref().unwrap_or("?"),
                        config.settings.operator_poll_secs
                    );
                    tokio::time::sleep(config.settings.operator_poll()).await;
                }
                ReconcileState::Deleted => {
                    let id = config.id.clone().unwrap_or_default();
                    return Err(ConfigError::RemoteRecordDeleted(id));
                }
            }
        }

        config.settings.validate().map_err(ConfigError::Invalid)?;
        self.normalize_paths(&mut config, identity).await?;
        Ok(config)
    }

    /// Run one reconciliation step, updating `config` and both stores.
    ///
    /// Returns the state observed before acting: `Uninitialized` means the
    /// local document was just pushed as the seed record. A freshly minted id
    /// always takes the push path.
    pub async fn reconcile(&self, config: &mut BoardConfig) -> Result<ReconcileState> {
        let (id, minted) = match config.id.clone() {
            Some(id) => (id, false),
            None => {
                let id = Uuid::new_v4().to_string();
                log::info!("No remote record id yet, registering board as {}", id);
                config.id = Some(id.clone());
                self.local.save(config).await?;
                (id, true)
            }
        };

        let remote = self.remote.fetch_config(&id).await?;
        let state = match classify(config, remote.as_ref()) {
            ReconcileState::Deleted if minted => ReconcileState::Uninitialized,
            state => state,
        };

        match (state, remote) {
            (ReconcileState::Uninitialized, _) => {
                if !config.is_claimed() {
                    config.status = BoardStatus::Uninitialized;
                }
                self.remote.upsert_config(&id, config).await?;
                self.local.save(config).await?;
                log::info!("Pushed local configuration as seed record {}", id);
            }
            (ReconcileState::Diverged, Some(mut newer)) => {
                log::info!(
                    "Remote configuration {} is newer ({}), adopting it",
                    id,
                    newer.last_modified.map(|ts| ts.to_rfc3339()).unwrap_or_default()
                );
                newer.id = Some(id.clone());
                newer.board = config.board.clone();
                *config = newer;
                self.local.save(config).await?;
            }
            (ReconcileState::Converged, Some(remote)) => {
                if remote.is_superseded_by(config) {
                    log::info!("Local configuration is newer than record {}, pushing it", id);
                    self.remote.upsert_config(&id, config).await?;
                }
            }
            (ReconcileState::Deleted, _) => {
                log::error!("Remote configuration record {} was deleted", id);
            }
            _ => {}
        }

        Ok(state)
    }

    /// Per-cycle check for an operator edit.
    pub async fn check_for_update(&self, current: &BoardConfig) -> Result<ConfigUpdate> {
        let id = current.id.as_deref().ok_or(ConfigError::Unassigned)?;

        match self.remote.fetch_config(id).await? {
            None => {
                log::error!("Remote configuration record {} was deleted", id);
                Ok(ConfigUpdate::Deleted)
            }
            Some(mut newer) if current.is_superseded_by(&newer) => {
                log::info!("Configuration {} changed remotely", id);
                newer.settings.validate().map_err(ConfigError::Invalid)?;
                newer.id = Some(id.to_string());
                newer.board = current.board.clone();
                newer.status = current.status;
                self.local.save(&newer).await?;
                Ok(ConfigUpdate::Changed(newer))
            }
            Some(_) => Ok(ConfigUpdate::Unchanged),
        }
    }

    /// Rewrite volatile device paths to stable identifiers.
    ///
    /// When anything changed the document is written to both stores.
    /// Paths that cannot be resolved are left alone; building the sensors
    /// reports them.
    pub async fn normalize_paths(
        &self,
        config: &mut BoardConfig,
        identity: &IdentityResolver,
    ) -> Result<bool> {
        let mut changed = false;
        for sensor in config.sensors.iter_mut() {
            match identity.normalize(&sensor.path) {
                Ok((stable, true)) => {
                    log::info!("Sensor {}: storing {} as {}", sensor.name, sensor.path, stable);
                    sensor.path = stable;
                    changed = true;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Sensor {}: cannot normalize {}: {}", sensor.name, sensor.path, e),
            }
        }

        if changed {
            self.local.save(config).await?;
            if let Some(id) = config.id.as_deref() {
                self.remote.upsert_config(id, config).await?;
            }
        }
        Ok(changed)
    }

    /// Record the agent's status locally and on the latest remote record.
    ///
    /// Only `status` and `board` are written to the remote record, so an
    /// operator edit made in the meantime is never overwritten.
    pub async fn publish_status(&self, config: &mut BoardConfig, status: BoardStatus) -> Result<()> {
        self.write_status(self.remote.as_ref(), config, status).await
    }

    /// Like [`publish_status`](Self::publish_status), but a single attempt
    /// through the direct store. Used once the loop has ended.
    pub async fn publish_final_status(
        &self,
        config: &mut BoardConfig,
        status: BoardStatus,
    ) -> Result<()> {
        self.write_status(self.direct.as_ref(), config, status).await
    }

    async fn write_status(
        &self,
        store: &dyn RemoteStore,
        config: &mut BoardConfig,
        status: BoardStatus,
    ) -> Result<()> {
        config.status = status;
        self.local.save(config).await?;

        let id = config.id.clone().ok_or(ConfigError::Unassigned)?;
        let mut latest = store
            .fetch_config(&id)
            .await?
            .ok_or_else(|| ConfigError::RemoteRecordDeleted(id.clone()))?;
        latest.id = Some(id.clone());
        latest.status = status;
        latest.board = config.board.clone();
        store.upsert_config(&id, &latest).await?;
        log::info!("Board {} status is now {}", id, status);
        Ok(())
    }
}
