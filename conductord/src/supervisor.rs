//! Engine process supervisor.
//!
//! Owns the single engine subprocess: spawns it on demand, waits for its
//! health endpoint, adopts a still-running engine left by a previous daemon,
//! and stops it on shutdown. A dead process is the only death signal; a
//! missed health check never triggers a restart on its own.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_common::config::{format_base_url, EngineConfig};
use conductor_common::paths::engine_log_path;
use conductor_common::process_utils::{
    find_free_port, force_kill, process_alive, read_proc_stat, terminate,
};
use conductor_common::{
    now_ms, BinaryInfo, BinarySource, BinaryState, ConductorError, ConductorResult, ProcessRecord,
};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::engine::EngineClient;
use crate::store::StateStore;

/// Binary searched on `PATH` when nothing else names the engine.
pub const DEFAULT_ENGINE_BINARY: &str = "opencode";

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(3);
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub running: bool,
    /// A spawn or stop is in progress; `record` is the last persisted one.
    pub starting: bool,
    pub record: Option<ProcessRecord>,
}

/// What the router and the control plane need from the engine owner.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    /// Return a live engine, spawning one if needed.
    async fn ensure_running(&self) -> ConductorResult<ProcessRecord>;

    /// Current state without waiting on an in-flight spawn.
    async fn status(&self) -> EngineStatus;

    async fn current(&self) -> Option<ProcessRecord> {
        let status = self.status().await;
        if status.running {
            status.record
        } else {
            None
        }
    }
}

#[derive(Default)]
struct Inner {
    child: Option<Child>,
    record: Option<ProcessRecord>,
}

pub struct Supervisor {
    config: EngineConfig,
    data_dir: PathBuf,
    store: Arc<StateStore>,
    client: EngineClient,
    inner: Mutex<Inner>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        data_dir: PathBuf,
        store: Arc<StateStore>,
        client: EngineClient,
    ) -> Self {
        Self {
            config,
            data_dir,
            store,
            client,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Adopt the engine recorded by a previous daemon if it is still alive and
    /// healthy; otherwise terminate it (alive but unhealthy) and clear the
    /// record.
    pub async fn adopt_or_clear(&self) -> ConductorResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(record) = self.store.snapshot().await.engine else {
            return Ok(());
        };

        if process_alive(record.pid, record.start_ticks) {
            if self.client.health(&record.base_url).await.unwrap_or(false) {
                info!(
                    pid = record.pid,
                    port = record.port,
                    base_url = %record.base_url,
                    "Adopted running engine"
                );
                inner.record = Some(record);
                return Ok(());
            }

            warn!(
                pid = record.pid,
                base_url = %record.base_url,
                "Recorded engine is alive but unhealthy; terminating it"
            );
            if let Err(err) = terminate(record.pid) {
                warn!(pid = record.pid, error = %err, "Failed to signal stale engine");
            }
        } else {
            debug!(pid = record.pid, "Recorded engine is gone");
        }

        self.clear_persisted().await
    }

    /// SIGTERM, wait up to three seconds, SIGKILL, then clear the record.
    pub async fn stop(&self) -> ConductorResult<()> {
        let mut inner = self.inner.lock().await;

        if let Some(mut child) = inner.child.take() {
            let pid = child.id();
            if let Some(pid) = pid {
                if let Err(err) = terminate(pid) {
                    debug!(pid, error = %err, "SIGTERM failed");
                }
            }
            match timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => info!(?pid, %status, "Engine stopped"),
                Ok(Err(err)) => warn!(?pid, error = %err, "Failed to reap engine"),
                Err(_) => {
                    warn!(?pid, "Engine ignored SIGTERM; killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        } else if let Some(record) = inner.record.as_ref() {
            stop_adopted(record).await;
        }

        let had_record = inner.record.take().is_some();
        drop(inner);
        if had_record || self.store.snapshot().await.engine.is_some() {
            self.clear_persisted().await?;
        }
        Ok(())
    }

    /// Check liveness of whatever `inner` holds and drop it if the process is
    /// gone. Returns the live record.
    async fn refresh(&self, inner: &mut Inner) -> ConductorResult<Option<ProcessRecord>> {
        let alive = match inner.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    warn!(%status, "Engine process exited");
                    false
                }
                Err(err) => {
                    warn!(error = %err, "Failed to poll engine process");
                    false
                }
            },
            None => inner
                .record
                .as_ref()
                .map(|record| process_alive(record.pid, record.start_ticks))
                .unwrap_or(false),
        };

        if alive {
            return Ok(inner.record.clone());
        }

        inner.child = None;
        if inner.record.take().is_some() {
            self.clear_persisted().await?;
        }
        Ok(None)
    }

    async fn spawn(&self, inner: &mut Inner) -> ConductorResult<ProcessRecord> {
        let mut binary = self.resolve_binary()?;
        binary.actual_version = probe_version(&binary.path).await;

        let host = self.config.host.clone();
        let port = match self.config.port {
            Some(port) => port,
            None => find_free_port(&host).map_err(|err| {
                ConductorError::unavailable(format!("no free port on {}: {}", host, err))
            })?,
        };
        let base_url = format_base_url(&host, port);

        let log_path = engine_log_path(&self.data_dir);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|err| {
                ConductorError::fatal(&format!("failed to open {}", log_path.display()), err)
            })?;
        let log_err = log
            .try_clone()
            .map_err(|err| ConductorError::fatal("failed to duplicate engine log handle", err))?;

        let mut command = Command::new(&binary.path);
        command
            .arg("serve")
            .arg("--hostname")
            .arg(&host)
            .arg("--port")
            .arg(port.to_string())
            .current_dir(&self.config.workdir)
            .env("CONDUCTOR_ENGINE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        info!(
            binary = %binary.path,
            source = ?binary.source,
            %host,
            port,
            "Spawning engine"
        );
        let mut child = command.spawn().map_err(|err| {
            ConductorError::unavailable(format!("failed to spawn engine {}: {}", binary.path, err))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ConductorError::unavailable("engine exited before reporting a pid"))?;

        if let Err(err) = self.wait_until_healthy(&mut child, &base_url).await {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }

        let record = ProcessRecord {
            pid,
            port,
            base_url: base_url.clone(),
            started_at: now_ms(),
            start_ticks: read_proc_stat(pid).ok().map(|stat| stat.starttime),
        };

        let persisted = record.clone();
        let binaries = BinaryState {
            engine: Some(binary),
        };
        if let Err(err) = self
            .store
            .with_lock(move |doc| {
                doc.engine = Some(persisted);
                doc.binaries = Some(binaries);
                Ok(())
            })
            .await
        {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(err);
        }

        info!(pid, port, %base_url, "Engine is healthy");
        inner.child = Some(child);
        inner.record = Some(record.clone());
        Ok(record)
    }

    async fn wait_until_healthy(&self, child: &mut Child, base_url: &str) -> ConductorResult<()> {
        let deadline = Instant::now() + self.config.startup_timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(ConductorError::unavailable(format!(
                        "engine exited during startup ({}); see {}",
                        status,
                        engine_log_path(&self.data_dir).display()
                    )));
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(ConductorError::unavailable(format!(
                        "failed to poll engine process: {}",
                        err
                    )));
                }
            }

            match self.client.health(base_url).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(%base_url, "Engine not ready yet"),
                Err(err) => debug!(%base_url, error = %err, "Engine health probe failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConductorError::unavailable(format!(
                    "engine did not become healthy within {}ms",
                    self.config.startup_timeout.as_millis()
                )));
            }
            sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn resolve_binary(&self) -> ConductorResult<BinaryInfo> {
        if let Some(configured) = &self.config.bin {
            return Ok(BinaryInfo {
                path: configured.path.display().to_string(),
                source: configured.source,
                actual_version: None,
            });
        }

        let found = which::which(DEFAULT_ENGINE_BINARY).map_err(|_| {
            ConductorError::unavailable(format!(
                "no engine binary configured and '{}' was not found on PATH",
                DEFAULT_ENGINE_BINARY
            ))
        })?;
        Ok(BinaryInfo {
            path: found.display().to_string(),
            source: BinarySource::Path,
            actual_version: None,
        })
    }

    async fn clear_persisted(&self) -> ConductorResult<()> {
        self.store
            .with_lock(|doc| {
                doc.engine = None;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl EngineProvider for Supervisor {
    async fn ensure_running(&self) -> ConductorResult<ProcessRecord> {
        let mut inner = self.inner.lock().await;
        if let Some(record) = self.refresh(&mut inner).await? {
            return Ok(record);
        }
        self.spawn(&mut inner).await
    }

    async fn status(&self) -> EngineStatus {
        let Ok(mut inner) = self.inner.try_lock() else {
            return EngineStatus {
                running: false,
                starting: true,
                record: self.store.snapshot().await.engine,
            };
        };

        match self.refresh(&mut inner).await {
            Ok(record) => EngineStatus {
                running: record.is_some(),
                starting: false,
                record,
            },
            Err(err) => {
                warn!(error = %err, "Failed to clear stale engine record");
                EngineStatus::default()
            }
        }
    }
}

async fn stop_adopted(record: &ProcessRecord) {
    if !process_alive(record.pid, record.start_ticks) {
        return;
    }
    if let Err(err) = terminate(record.pid) {
        debug!(pid = record.pid, error = %err, "SIGTERM failed");
    }

    let deadline = Instant::now() + STOP_GRACE;
    while Instant::now() < deadline {
        if !process_alive(record.pid, record.start_ticks) {
            info!(pid = record.pid, "Adopted engine stopped");
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }

    warn!(pid = record.pid, "Adopted engine ignored SIGTERM; killing");
    if let Err(err) = force_kill(record.pid) {
        warn!(pid = record.pid, error = %err, "SIGKILL failed");
    }
}

/// First line of `<bin> --version`, if the binary answers quickly.
async fn probe_version(binary: &str) -> Option<String> {
    let output = timeout(
        VERSION_PROBE_TIMEOUT,
        Command::new(binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
