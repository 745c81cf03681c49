pub mod agent;
pub mod config;
pub mod device;
pub mod logging;
pub mod remote;
pub mod serial;

use std::path::PathBuf;
use std::sync::Arc;

use agent::{Agent, AgentError, Exit, NoopPower, PowerControl, SystemPower};
use config::{BoardIdentity, ConfigError, ConfigReconciler, LocalConfigStore};
use device::{default_topology, IdentityResolver};
use logging::LogFile;
use remote::{HttpRemoteStore, RemoteStore, RetryingStore};
use serial::NativeOpener;

/// Process-level options, normally from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub log_file: PathBuf,
    /// Exit instead of rebooting the board when recovery escalates
    pub no_reboot: bool,
}

/// Run the agent until it is stopped, escalates or fails.
pub async fn run(options: RunOptions) -> Result<(), AgentError> {
    let local = LocalConfigStore::new(&options.config_path);
    let document = local.load().await?;
    if document.remote.server.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.server is not set".to_string()).into());
    }

    let settings = &document.settings;
    log::info!(
        "Remote store {} ({}.{}), reading every {} s",
        document.remote.server,
        document.remote.db_name,
        document.remote.collection_name,
        settings.reading_interval_secs
    );
    let http: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::new(&document.remote)?);
    let remote: Arc<dyn RemoteStore> = Arc::new(RetryingStore::new(
        http.clone(),
        settings.remote_retry_attempts,
        settings.remote_retry_interval(),
    ));

    let power: Arc<dyn PowerControl> = if options.no_reboot {
        Arc::new(NoopPower::new())
    } else {
        Arc::new(SystemPower)
    };

    let mut agent = Agent::new(
        ConfigReconciler::new(local, remote).with_direct_store(http),
        IdentityResolver::new(default_topology()),
        Arc::new(NativeOpener),
        power,
        LogFile::new(&options.log_file),
    );

    if let Err(e) = agent.startup(BoardIdentity::detect()).await {
        return agent.finish(Exit::Fatal(e)).await;
    }

    let exit = agent
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;
    agent.finish(exit).await
}
