//! Main daemon command - acquires the bus name and serves until signalled

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use zbus::Connection;

use kapsule_daemon::bus::{ManagerIface, BUS_NAME, MANAGER_PATH};
use kapsule_daemon::config::Configuration;
use kapsule_daemon::incus::{IncusClient, InstanceBackend};
use kapsule_daemon::ops::OperationEngine;
use kapsule_daemon::service::{ContainerService, PtyxisClient};

/// Run the daemon
pub async fn run(config_path: Option<&Path>, socket: &Path) -> Result<()> {
    let config = match config_path {
        Some(path) => Configuration::load_from(path)?,
        None => Configuration::load()?,
    };
    info!("Configuration loaded");
    info!("  default_container: {:?}", config.default_container);
    info!("  default_image: {}", config.default_image);

    let client = IncusClient::new(socket);
    match client.ping().await {
        Ok(()) => info!("Incus backend reachable at {}", socket.display()),
        Err(e) => warn!(
            "Incus backend at {} not reachable ({}); calls will fail until it returns",
            socket.display(),
            e
        ),
    }
    let backend: Arc<dyn InstanceBackend> = Arc::new(client);

    let connection = Connection::system().await?;
    let engine = Arc::new(OperationEngine::new(connection.clone()));
    let ptyxis = PtyxisClient::new(connection.clone());
    let service = Arc::new(ContainerService::new(backend, config, Some(ptyxis)));

    // The Manager is served before the name is requested, so no caller can
    // reach a half-initialized object tree.
    connection
        .object_server()
        .at(MANAGER_PATH, ManagerIface::new(service, engine.clone()))
        .await?;
    connection.request_name(BUS_NAME).await?;
    info!("Acquired {} on the system bus", BUS_NAME);

    wait_for_shutdown().await?;
    warn!("Shutdown signal received, stopping");

    engine.shutdown().await;
    connection.release_name(BUS_NAME).await?;

    info!("Daemon stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}
