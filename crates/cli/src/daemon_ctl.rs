//! `conductor daemon run|start|stop|status`.

use std::fs::OpenOptions;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use conductor_common::config::{resolve_daemon_config, ClientConfig, CliOverrides, ENV_TOKEN};
use conductor_common::fs::create_private_dir;
use conductor_common::paths::daemon_log_path;
use conductord::args::DaemonArgs;
use conductord_client::{ClientError, ControlClient};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::output::{health_summary, Rendered};

/// How long each health wait runs before the child is checked for an early exit.
const HEALTH_SLICE: Duration = Duration::from_millis(500);

/// Run the daemon in this process until it is asked to stop.
pub async fn run_foreground(overrides: CliOverrides, args: &DaemonArgs) -> Result<Rendered> {
    let mut overrides = overrides;
    args.apply(&mut overrides);
    let config = resolve_daemon_config(&overrides, |key| std::env::var(key).ok())?;
    conductord::run(config).await?;
    Ok(Rendered::new(&json!({ "ok": true }), "daemon stopped"))
}

/// Spawn `conductor daemon run` detached and wait for its health endpoint.
pub async fn start(
    client: &ControlClient,
    config: &ClientConfig,
    args: &DaemonArgs,
    debug_logs: bool,
    wait: Duration,
) -> Result<Rendered> {
    if let Ok(health) = client.health().await {
        let human = format!("daemon already running at {}", client.base_url());
        return Ok(Rendered::new(
            &json!({ "started": false, "health": health }),
            human,
        ));
    }

    create_private_dir(&config.data_dir)
        .with_context(|| format!("Failed to create data dir {}", config.data_dir.display()))?;
    let log_path = daemon_log_path(&config.data_dir);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open {}", log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate daemon log handle")?;

    let exe = std::env::current_exe().context("Failed to locate the conductor executable")?;
    let mut command = Command::new(&exe);
    command
        .arg("daemon")
        .arg("run")
        .arg("--data-dir")
        .arg(&config.data_dir)
        .arg("--daemon-host")
        .arg(&config.host)
        .arg("--daemon-port")
        .arg(config.port.to_string())
        .args(args.to_args())
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if debug_logs {
        command.arg("--debug");
    }
    // Keep the token out of the process list.
    if let Some(token) = &config.token {
        command.env(ENV_TOKEN, token);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {}", exe.display()))?;
    info!(pid = child.id(), "Spawned daemon");

    let deadline = Instant::now() + wait;
    loop {
        if let Some(status) = child.try_wait().context("Failed to poll daemon process")? {
            bail!(
                "daemon exited during startup ({}); see {}",
                status,
                log_path.display()
            );
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match client.wait_until_healthy(remaining.min(HEALTH_SLICE)).await {
            Ok(health) => {
                let human = format!(
                    "daemon started (pid {}) at {}",
                    child.id(),
                    client.base_url()
                );
                return Ok(Rendered::new(
                    &json!({ "started": true, "health": health }),
                    human,
                ));
            }
            Err(err) => debug!(error = %err, "Waiting for daemon"),
        }
        if Instant::now() >= deadline {
            bail!(
                "daemon did not answer within {}ms; see {}",
                wait.as_millis(),
                log_path.display()
            );
        }
    }
}

pub async fn stop(client: &ControlClient, wait: Duration) -> Result<Rendered> {
    match client.shutdown().await {
        Ok(_) => {}
        Err(ClientError::DaemonUnavailable(url)) => bail!("no daemon running at {}", url),
        Err(err) => return Err(err.into()),
    }
    client
        .wait_until_gone(wait)
        .await
        .with_context(|| format!("daemon did not exit within {}ms", wait.as_millis()))?;
    Ok(Rendered::new(
        &json!({ "ok": true, "stopped": true }),
        "daemon stopped",
    ))
}

pub async fn status(client: &ControlClient) -> Result<Rendered> {
    let health = match client.health().await {
        Ok(health) => health,
        Err(ClientError::DaemonUnavailable(url)) => bail!("no daemon running at {}", url),
        Err(err) => return Err(err.into()),
    };
    let human = health_summary(&health);
    Ok(Rendered::new(&health, human))
}
