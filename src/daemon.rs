//! Daemon assembly: builds the collaborators from the configuration, runs
//! the RPC server and the exit reaper, and stops on SIGTERM or SIGINT.

use crate::access_lists::{AccountDb, SystemAccounts};
use crate::config::ServiceConfig;
use crate::daemon_log::daemon_log;
use crate::lifecycle_watcher::PollingWatcher;
use crate::platform_io::{Catalog, CatalogIo};
use crate::platform_service::PlatformService;
use crate::process_table::ProcFs;
use crate::rpc::{bind_socket, serve_rpc};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, Mutex};

/// Closes the session of every pid the lifecycle watcher reports. Returns
/// when the watcher goes away.
pub async fn reap_exited_clients(
    service: Arc<Mutex<PlatformService>>,
    mut exited: mpsc::UnboundedReceiver<u32>,
) {
    while let Some(pid) = exited.recv().await {
        service.lock().await.handle_client_exit(pid);
    }
    daemon_log("daemon", "Lifecycle watcher closed, reaper exiting");
}

/// Runs the daemon until a termination signal arrives.
pub async fn run(config: ServiceConfig) -> Result<()> {
    let catalog = match &config.catalog_path {
        Some(path) => Catalog::load(path)?,
        None => Catalog::builtin()?,
    };
    let io = Arc::new(CatalogIo::new(catalog));
    let accounts: Arc<dyn AccountDb> = Arc::new(SystemAccounts);
    let process_table = Arc::new(ProcFs::new());
    let (watcher, exited) = PollingWatcher::new(
        process_table.clone(),
        Duration::from_millis(config.watch_interval_ms),
    );
    let service = PlatformService::new(
        &config,
        io,
        Arc::clone(&accounts),
        process_table,
        Arc::new(watcher),
    )
    .context("Failed to start the platform service")?;
    let service = Arc::new(Mutex::new(service));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let listener = bind_socket(&config.socket_path)?;
    let reaper = tokio::spawn(reap_exited_clients(Arc::clone(&service), exited));
    let server = tokio::spawn(serve_rpc(
        listener,
        Arc::clone(&service),
        accounts,
        shutdown_tx.subscribe(),
    ));
    tracing::info!(
        socket = %config.socket_path.display(),
        run_root = %config.run_root.display(),
        "geopmd started"
    );

    tokio::select! {
        _ = sigterm.recv() => daemon_log("daemon", "Received SIGTERM"),
        _ = sigint.recv() => daemon_log("daemon", "Received SIGINT"),
    }

    // Receiver dropped means the server already exited - safe to ignore
    let _ = shutdown_tx.send(());
    let served = server.await.context("RPC server task failed")?;
    reaper.abort();
    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        daemon_log("daemon", &format!("Failed to remove socket: {}", e));
    }
    tracing::info!("geopmd stopped");
    served
}
