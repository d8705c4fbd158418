//! Layered configuration: CLI flag, then environment variable, then the TOML
//! config file, then built-in defaults.
//!
//! Environment lookups go through an injected closure so callers (and tests)
//! decide where variables come from.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConductorError, ConductorResult};
use crate::paths;
use crate::types::BinarySource;

pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";
pub const DEFAULT_DAEMON_PORT: u16 = 8787;
pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;

pub const ENV_CONFIG: &str = "CONDUCTOR_CONFIG";
pub const ENV_DAEMON_HOST: &str = "CONDUCTOR_DAEMON_HOST";
pub const ENV_DAEMON_PORT: &str = "CONDUCTOR_DAEMON_PORT";
pub const ENV_TOKEN: &str = "CONDUCTOR_TOKEN";
pub const ENV_ENGINE_BIN: &str = "CONDUCTOR_ENGINE_BIN";
pub const ENV_ENGINE_HOST: &str = "CONDUCTOR_ENGINE_HOST";
pub const ENV_ENGINE_PORT: &str = "CONDUCTOR_ENGINE_PORT";
pub const ENV_IDLE_DISPOSE_AFTER: &str = "CONDUCTOR_IDLE_DISPOSE_AFTER";

/// Values given explicitly on the command line. `None` means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub daemon_host: Option<String>,
    pub daemon_port: Option<u16>,
    pub token: Option<String>,
    pub engine_bin: Option<PathBuf>,
    pub engine_host: Option<String>,
    pub engine_port: Option<u16>,
    pub engine_workdir: Option<PathBuf>,
    pub startup_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub idle_dispose_after_secs: Option<u64>,
}

/// Contents of `conductor.toml`. Every key is optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub daemon: FileDaemonSection,
    pub engine: FileEngineSection,
    pub instances: FileInstancesSection,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileDaemonSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileEngineSection {
    pub bin: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub workdir: Option<PathBuf>,
    pub startup_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileInstancesSection {
    pub idle_dispose_after_secs: Option<u64>,
}

/// An engine binary chosen by configuration rather than by a `PATH` search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfiguredBinary {
    pub path: PathBuf,
    pub source: BinarySource,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `None` defers to a `PATH` search at spawn time.
    pub bin: Option<ConfiguredBinary>,
    pub host: String,
    /// `None` picks a free loopback port on every spawn.
    pub port: Option<u16>,
    pub workdir: PathBuf,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
}

/// Fully resolved settings for a daemon process.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub engine: EngineConfig,
    pub idle_dispose_after: Option<Duration>,
}

/// Settings a control-plane client needs to find and talk to the daemon.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl ClientConfig {
    pub fn base_url(&self) -> String {
        format_base_url(&self.host, self.port)
    }
}

/// `http://host:port`, bracketing IPv6 literals.
pub fn format_base_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{}]:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Read and parse a TOML config file.
///
/// An explicitly requested file must exist; the implicit
/// `<data dir>/conductor.toml` is optional.
pub fn load_file_config(path: &Path, required: bool) -> ConductorResult<Option<FileConfig>> {
    if !path.exists() {
        if required {
            return Err(ConductorError::invalid(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|err| {
        ConductorError::invalid(format!("failed to read config {}: {}", path.display(), err))
    })?;
    let parsed: FileConfig = toml::from_str(&contents).map_err(|err| {
        ConductorError::invalid(format!("failed to parse config {}: {}", path.display(), err))
    })?;
    Ok(Some(parsed))
}

/// Locate and load the config file for `data_dir`.
fn locate_file_config<F>(
    cli: &CliOverrides,
    data_dir: &Path,
    env: &F,
) -> ConductorResult<FileConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let explicit = cli
        .config
        .clone()
        .or_else(|| non_empty(env(ENV_CONFIG)).map(PathBuf::from))
        .map(paths::expand_tilde);

    let loaded = match explicit {
        Some(path) => load_file_config(&path, true)?,
        None => load_file_config(&paths::config_path(data_dir), false)?,
    };
    Ok(loaded.unwrap_or_default())
}

pub fn resolve_daemon_config<F>(cli: &CliOverrides, env: F) -> ConductorResult<DaemonConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let data_dir = paths::resolve_data_dir_with(cli.data_dir.as_deref(), &env);
    let file = locate_file_config(cli, &data_dir, &env)?;

    let host = cli
        .daemon_host
        .clone()
        .or_else(|| non_empty(env(ENV_DAEMON_HOST)))
        .or_else(|| file.daemon.host.clone())
        .unwrap_or_else(|| DEFAULT_DAEMON_HOST.to_string());
    let port = match cli.daemon_port {
        Some(port) => port,
        None => parse_env(&env, ENV_DAEMON_PORT)?
            .or(file.daemon.port)
            .unwrap_or(DEFAULT_DAEMON_PORT),
    };
    let token = cli
        .token
        .clone()
        .or_else(|| non_empty(env(ENV_TOKEN)))
        .or_else(|| file.daemon.token.clone())
        .and_then(|token| non_empty(Some(token)));

    let bin = if let Some(path) = cli.engine_bin.clone() {
        Some(ConfiguredBinary {
            path: paths::expand_tilde(path),
            source: BinarySource::Flag,
        })
    } else if let Some(path) = non_empty(env(ENV_ENGINE_BIN)) {
        Some(ConfiguredBinary {
            path: paths::expand_tilde(PathBuf::from(path)),
            source: BinarySource::Env,
        })
    } else {
        file.engine.bin.clone().map(|path| ConfiguredBinary {
            path: paths::expand_tilde(path),
            source: BinarySource::Config,
        })
    };

    let engine_host = cli
        .engine_host
        .clone()
        .or_else(|| non_empty(env(ENV_ENGINE_HOST)))
        .or_else(|| file.engine.host.clone())
        .unwrap_or_else(|| DEFAULT_ENGINE_HOST.to_string());
    let engine_port = match cli.engine_port {
        Some(port) => Some(port),
        None => parse_env(&env, ENV_ENGINE_PORT)?.or(file.engine.port),
    }
    .filter(|port| *port != 0);
    let workdir = cli
        .engine_workdir
        .clone()
        .or_else(|| file.engine.workdir.clone())
        .map(paths::expand_tilde)
        .unwrap_or_else(|| data_dir.clone());

    let startup_timeout_ms = cli
        .startup_timeout_ms
        .or(file.engine.startup_timeout_ms)
        .unwrap_or(DEFAULT_STARTUP_TIMEOUT_MS);
    let request_timeout_ms = cli
        .request_timeout_ms
        .or(file.engine.request_timeout_ms)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
    if startup_timeout_ms == 0 || request_timeout_ms == 0 {
        return Err(ConductorError::invalid("timeouts must be greater than zero"));
    }

    let idle_secs = match cli.idle_dispose_after_secs {
        Some(secs) => Some(secs),
        None => parse_env(&env, ENV_IDLE_DISPOSE_AFTER)?.or(file.instances.idle_dispose_after_secs),
    };

    Ok(DaemonConfig {
        data_dir,
        host,
        port,
        token,
        engine: EngineConfig {
            bin,
            host: engine_host,
            port: engine_port,
            workdir,
            startup_timeout: Duration::from_millis(startup_timeout_ms),
            request_timeout: Duration::from_millis(request_timeout_ms),
        },
        idle_dispose_after: idle_secs.filter(|secs| *secs > 0).map(Duration::from_secs),
    })
}

pub fn resolve_client_config<F>(cli: &CliOverrides, env: F) -> ConductorResult<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let data_dir = paths::resolve_data_dir_with(cli.data_dir.as_deref(), &env);
    let file = locate_file_config(cli, &data_dir, &env)?;

    let host = cli
        .daemon_host
        .clone()
        .or_else(|| non_empty(env(ENV_DAEMON_HOST)))
        .or_else(|| file.daemon.host.clone())
        .unwrap_or_else(|| DEFAULT_DAEMON_HOST.to_string());
    let port = match cli.daemon_port {
        Some(port) => port,
        None => parse_env(&env, ENV_DAEMON_PORT)?
            .or(file.daemon.port)
            .unwrap_or(DEFAULT_DAEMON_PORT),
    };
    let token = cli
        .token
        .clone()
        .or_else(|| non_empty(env(ENV_TOKEN)))
        .or_else(|| file.daemon.token.clone())
        .and_then(|token| non_empty(Some(token)));

    Ok(ClientConfig {
        data_dir,
        host,
        port,
        token,
    })
}

/// Reject any bind host that is not loopback.
pub fn ensure_loopback(host: &str) -> ConductorResult<()> {
    let trimmed = host.trim().trim_start_matches('[').trim_end_matches(']');
    if trimmed.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }
    match trimmed.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(()),
        Ok(_) => Err(ConductorError::invalid(format!(
            "refusing to bind non-loopback address '{}'",
            host
        ))),
        Err(_) => Err(ConductorError::invalid(format!(
            "host '{}' is not a loopback address",
            host
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_env<F, T>(env: &F, key: &str) -> ConductorResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(env(key)) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|err| ConductorError::invalid(format!("{}='{}': {}", key, raw, err))),
    }
}
