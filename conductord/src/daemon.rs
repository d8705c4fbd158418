//! Daemon bootstrap and graceful shutdown.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use conductor_common::config::{ensure_loopback, format_base_url, DaemonConfig};
use conductor_common::fs::create_private_dir;
use conductor_common::paths::{daemon_lock_path, state_path};
use conductor_common::process_utils::read_proc_stat;
use conductor_common::{now_ms, ProcessRecord};
use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::EngineClient;
use crate::eviction::spawn_idle_eviction_task;
use crate::http::{self, ControlPlane};
use crate::registry::Registry;
use crate::router::InstanceRouter;
use crate::store::StateStore;
use crate::supervisor::{EngineProvider, Supervisor};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the daemon until SIGINT, SIGTERM or `POST /shutdown`.
pub async fn run(config: DaemonConfig) -> Result<()> {
    ensure_loopback(&config.host)?;
    create_private_dir(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
    let _lock = acquire_daemon_lock(&config.data_dir)?;

    let store = Arc::new(StateStore::open(state_path(&config.data_dir)));

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| {
            format!(
                "Failed to bind control plane to {}:{}",
                config.host, config.port
            )
        })?;
    let addr = listener.local_addr()?;
    let base_url = format_base_url(&config.host, addr.port());

    let pid = std::process::id();
    let daemon_record = ProcessRecord {
        pid,
        port: addr.port(),
        base_url: base_url.clone(),
        started_at: now_ms(),
        start_ticks: read_proc_stat(pid).ok().map(|stat| stat.starttime),
    };
    store
        .with_lock(move |doc| {
            doc.daemon = Some(daemon_record);
            doc.cli_version = Some(VERSION.to_string());
            Ok(())
        })
        .await?;

    info!("{}", conductor_build_info::banner("conductord", VERSION));
    info!(data_dir = %config.data_dir.display(), "Using data directory");

    let client = EngineClient::new(config.engine.request_timeout)?;
    let supervisor = Arc::new(Supervisor::new(
        config.engine.clone(),
        config.data_dir.clone(),
        store.clone(),
        client.clone(),
    ));
    if let Err(err) = supervisor.adopt_or_clear().await {
        warn!(error = %err, "Failed to reconcile recorded engine");
    }

    let engine: Arc<dyn EngineProvider> = supervisor.clone();
    let registry = Arc::new(Registry::new(store.clone()));
    let router = Arc::new(InstanceRouter::new(registry.clone(), engine.clone(), client));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx.clone());

    if let Some(threshold) = config.idle_dispose_after {
        spawn_idle_eviction_task(
            store.clone(),
            router.clone(),
            engine.clone(),
            threshold,
            shutdown_rx.clone(),
        );
    }

    let warm = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = warm.ensure_running().await {
            warn!(error = %err, "Engine did not start; will retry on demand");
        }
    });

    let state = ControlPlane::new(
        store.clone(),
        registry,
        router,
        engine,
        config.token.clone(),
        config.data_dir.clone(),
        shutdown_tx,
    );
    let app = http::router(state);

    info!(%base_url, "Control plane listening");
    let mut signal_rx = shutdown_rx;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut signal_rx).await })
        .await
        .context("Control plane encountered an unrecoverable error")?;

    info!("Graceful shutdown initiated");
    if let Err(err) = supervisor.stop().await {
        warn!(error = %err, "Failed to stop engine cleanly");
    }
    if let Err(err) = store
        .with_lock(|doc| {
            doc.daemon = None;
            Ok(())
        })
        .await
    {
        warn!(error = %err, "Failed to clear daemon record");
    }
    info!("Daemon stopped");
    Ok(())
}

/// One daemon per data dir: hold an exclusive lock on `daemon.lock` for the
/// life of the process.
fn acquire_daemon_lock(data_dir: &Path) -> Result<File> {
    let path = daemon_lock_path(data_dir);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    if file.try_lock_exclusive().is_err() {
        bail!("another daemon is already running for {}", data_dir.display());
    }
    Ok(file)
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    let ctrl_c_tx = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down daemon");
            ctrl_c_tx.send_replace(true);
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                return;
            }
        };
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                info!("Received SIGTERM; shutting down daemon");
                shutdown.send_replace(true);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::config::{resolve_daemon_config, CliOverrides};
    use tempfile::tempdir;

    #[tokio::test]
    async fn refuses_non_loopback_host() {
        let dir = tempdir().unwrap();
        let overrides = CliOverrides {
            data_dir: Some(dir.path().to_path_buf()),
            daemon_host: Some("0.0.0.0".into()),
            ..CliOverrides::default()
        };
        let config = resolve_daemon_config(&overrides, |_| None).unwrap();
        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn second_lock_on_same_data_dir_fails() {
        let dir = tempdir().unwrap();
        let _held = acquire_daemon_lock(dir.path()).unwrap();
        let err = acquire_daemon_lock(dir.path()).unwrap_err();
        assert!(err.to_string().contains("already running"));
    }
}
