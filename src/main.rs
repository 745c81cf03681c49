use std::path::PathBuf;
use anyhow::Context;
use clap::Parser;

use sensorlink_lib::{logging, RunOptions};

/// Poll serial measurement devices and ship their readings to the remote store
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Local configuration document
    #[arg(long, default_value = "/etc/sensorlink/config.json")]
    config: PathBuf,

    /// Log file, uploaded to the remote store every cycle
    #[arg(long, default_value = "/var/log/sensorlink/agent.log")]
    log_file: PathBuf,

    /// Exit instead of rebooting the board when recovery escalates
    #[arg(long)]
    no_reboot: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init(&args.log_file)
        .with_context(|| format!("cannot open log file {}", args.log_file.display()))?;
    log::info!("sensorlink {} starting", env!("CARGO_PKG_VERSION"));

    sensorlink_lib::run(RunOptions {
        config_path: args.config,
        log_file: args.log_file,
        no_reboot: args.no_reboot,
    })
    .await
    .context("agent stopped")?;

    Ok(())
}
