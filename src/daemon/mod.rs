//! Daemon Server
//!
//! The only process that talks to the desk. Clients connect over a local
//! socket and send one JSON request per line.

pub mod pidfile;
pub mod protocol;
pub mod server;

use crate::domain::settings::Config;
use crate::domain::sitting::SittingTracker;
use crate::infrastructure::bluetooth::btle::BtleAdapter;
use crate::infrastructure::bluetooth::manager::{DeskManager, ManagerConfig};
use crate::infrastructure::idle::NoIdleTracking;
use interprocess::local_socket::{tokio::prelude::*, GenericFilePath, ListenerOptions, ToFsName};
use pidfile::{Acquire, PidGuard};
use server::Dispatcher;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to write pid file {path}: {source}")]
    PidWrite { path: PathBuf, source: io::Error },
    #[error("failed to remove stale socket {path}: {source}")]
    StaleSocket { path: PathBuf, source: io::Error },
    #[error("failed to listen on {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to install signal handler: {0}")]
    Signal(io::Error),
}

fn remove_stale_socket(path: &Path) -> Result<(), DaemonError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(file = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(DaemonError::StaleSocket {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Run the daemon until SIGINT or SIGTERM.
///
/// Returns `Ok` without doing anything when another daemon already owns the
/// pid file.
pub async fn run_daemon(config: Config) -> Result<(), DaemonError> {
    let _guard = match PidGuard::acquire(&config.pid_file_path, &config.socket_path)? {
        Acquire::Acquired(guard) => guard,
        Acquire::AlreadyRunning(pid) => {
            info!(pid, "Daemon already running");
            return Ok(());
        }
    };

    remove_stale_socket(&config.socket_path)?;
    let bind_error = |source| DaemonError::Bind {
        path: config.socket_path.clone(),
        source,
    };
    let name = config
        .socket_path
        .as_path()
        .to_fs_name::<GenericFilePath>()
        .map_err(bind_error)?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(bind_error)?;
    info!(socket = %config.socket_path.display(), "Listening");

    let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;

    let manager = DeskManager::new(BtleAdapter::new(), ManagerConfig::from(&config));
    let dispatcher = Dispatcher::new(
        manager.clone(),
        SittingTracker::new(&config),
        config.stand_threshold,
    );

    let ble = manager.clone();
    let ble_task = tokio::spawn(async move { ble.run_with_retry().await });
    let mut events = manager.subscribe();
    let event_task = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(?event, "Desk event"),
                Err(RecvError::Lagged(n)) => warn!("Event logger lagged, dropped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let tracker = dispatcher.clone();
    let sitting_task = tokio::spawn(async move { tracker.track_sitting(NoIdleTracking).await });

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    debug!("Client connected");
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server::serve_connection(stream, dispatcher).await {
                            warn!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Terminated, shutting down");
                break;
            }
        }
    }

    sitting_task.abort();
    if let Some(session) = manager.current_session() {
        session.stop_moving().await;
        session.disconnect().await;
    }
    ble_task.abort();
    event_task.abort();
    Ok(())
}
