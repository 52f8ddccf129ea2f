use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use warden_ipc::{paths::RuntimePaths, socket};

use crate::config::ManagerConfig;
use crate::controller::OrchestrationController;

mod admin;
mod backup;
mod config;
mod controller;
mod daemon;
mod errors;
mod loadout;
mod lock;
mod supervisor;
#[cfg(test)]
mod test_support;
mod util;

const LOG_TAIL_LINES: usize = 2000;

#[derive(Debug, Parser)]
#[command(name = "wardend", version, about = "Supervises one game server and keeps its world backed up")]
struct Args {
    /// Config file. Defaults to $WARDEN_CONFIG, then the platform config dir.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = Args::parse();

    let logs = supervisor::LogStore::new(LOG_TAIL_LINES);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(logs.manager_writer())
        .init();

    let config_path = match args
        .config
        .or_else(|| std::env::var_os("WARDEN_CONFIG").map(PathBuf::from))
    {
        Some(path) => path,
        None => config::default_config_path().map_err(io::Error::other)?,
    };
    let config = ManagerConfig::load(&config_path).map_err(|err| {
        error!("{err}");
        io::Error::other(err)
    })?;

    let paths = RuntimePaths::resolve();
    paths.ensure()?;

    // single-instance lock
    let _guard = match lock::acquire_lock(&paths.lock_path) {
        Ok(guard) => guard,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            warn!("daemon already running (lock held), exiting");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let listener = match socket::listen(&paths.socket_path).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!("daemon already running (socket alive), exiting");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let controller = Arc::new(OrchestrationController::from_config(&config, logs).map_err(|err| {
        error!("{err}");
        io::Error::other(err)
    })?);
    controller.start_scheduler();
    info!(
        "wardend listening at {:?}, managing {}",
        paths.socket_path,
        config.server_executable.display()
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("signal received, shutting down");
            shutdown.cancel();
        }
    });

    let served = daemon::serve(listener, Arc::clone(&controller), shutdown).await;
    controller.shutdown().await;
    if let Err(err) = std::fs::remove_file(&paths.socket_path) {
        warn!("failed to remove socket {:?}: {err}", paths.socket_path);
    }
    served
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(err) => {
            warn!("SIGTERM handler unavailable: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
