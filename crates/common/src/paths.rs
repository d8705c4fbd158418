//! Data-directory layout and path helpers.

use std::env;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "CONDUCTOR_DATA_DIR";
pub const STATE_FILE: &str = "conductor-state.json";
pub const CONFIG_FILE: &str = "conductor.toml";
pub const ENGINE_LOG_FILE: &str = "engine.log";
pub const DAEMON_LOG_FILE: &str = "daemon.log";
pub const DAEMON_LOCK_FILE: &str = "daemon.lock";

/// Resolve the data directory: explicit override, then `CONDUCTOR_DATA_DIR`,
/// then `~/.conductor`. `env` is the environment lookup.
pub fn resolve_data_dir_with<F>(explicit: Option<&Path>, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = explicit {
        return expand_tilde(dir.to_path_buf());
    }

    if let Some(dir) = env(DATA_DIR_ENV).filter(|value| !value.trim().is_empty()) {
        return expand_tilde(PathBuf::from(dir));
    }

    match env("HOME") {
        Some(home) if !home.trim().is_empty() => PathBuf::from(home).join(".conductor"),
        _ => PathBuf::from(".conductor"),
    }
}

pub fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATE_FILE)
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn engine_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join(ENGINE_LOG_FILE)
}

pub fn daemon_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DAEMON_LOG_FILE)
}

pub fn daemon_lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DAEMON_LOCK_FILE)
}

/// Tilde-expand `path`, join it onto `base` when relative, and clean `.`/`..`
/// lexically. Symlinks are left alone.
pub fn absolutize(path: &Path, base: &Path) -> PathBuf {
    let expanded = expand_tilde(path.to_path_buf());
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    path_clean::clean(joined)
}

pub fn expand_tilde(path: PathBuf) -> PathBuf {
    if !path.starts_with("~") {
        return path;
    }

    let Ok(home) = env::var("HOME") else {
        return path;
    };

    if path == Path::new("~") {
        return PathBuf::from(home);
    }

    match path.strip_prefix("~") {
        Ok(rest) => PathBuf::from(home).join(rest),
        Err(_) => path,
    }
}
