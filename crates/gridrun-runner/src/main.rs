//! GridRun Runner Daemon
//!
//! Registers with the coordination service over a single persistent
//! connection, then accepts, executes and reports on jobs until shut down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod capability;
mod config;
mod connection;
mod job;
mod storage;
mod workdirs;

use capability::SystemProbe;
use config::RunnerConfig;
use connection::{ConnectionManager, TcpTransport};
use job::JobManager;
use storage::LocalStore;
use workdirs::WorkDirs;

#[derive(Parser)]
#[command(
    name = "gridrun-runner",
    about = "Executes jobs assigned by a GridRun coordination service"
)]
struct Args {
    /// Root directory for runner state (cache, config, logs, job dirs).
    #[arg(long, default_value = "gridrun-data")]
    work_dir: PathBuf,

    /// Config file path. Defaults to <work-dir>/config/runner.json.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the coordination service endpoint (host:port).
    #[arg(long)]
    endpoint: Option<String>,

    /// Tracing filter, e.g. "info" or "gridrun_runner=debug".
    #[arg(long, default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter)?)
        .with_target(true)
        .init();

    if let Err(e) = run(args).await {
        error!(error = %e, "Fatal error on startup");
        return Err(e);
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let dirs = WorkDirs::create(&args.work_dir)?;
    let config_path = args.config.unwrap_or_else(|| dirs.config_file());
    let mut config = RunnerConfig::load(&config_path)?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    info!(
        runner_id = %config.runner_id,
        endpoint = %config.endpoint,
        work_dir = %dirs.root().display(),
        "Starting GridRun runner"
    );

    let transport = Arc::new(TcpTransport::new(
        config.endpoint.clone(),
        Duration::from_secs(config.connect_timeout_secs),
    ));
    let manager = ConnectionManager::new(
        transport,
        config.credentials(),
        config.connection(),
        hostname(),
    );
    let (handle, connection_task) = manager.start().await?;

    let mirror = config
        .artifact_mirror
        .clone()
        .unwrap_or_else(|| dirs.root().join("mirror"));
    let store = Arc::new(LocalStore::new(dirs.jobs_dir(), mirror));
    let probe = Arc::new(SystemProbe::new(dirs.jobs_dir()));

    let job_manager = JobManager::new(
        handle.clone(),
        probe,
        store,
        config.runner_id.clone(),
        config.job_policy(),
        config.manager(),
        dirs.capability_cache(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager_task = tokio::spawn(job_manager.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    // Jobs are detached, not killed; running simulations survive us.
    let _ = shutdown_tx.send(true);
    let _ = manager_task.await;

    config.save(&config_path)?;
    handle.close();
    let _ = tokio::time::timeout(Duration::from_secs(10), connection_task).await;

    info!("Runner stopped");
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
