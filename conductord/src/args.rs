//! Daemon flags shared by `conductord` and `conductor daemon run|start`.

use std::path::PathBuf;

use clap::Args;
use conductor_common::config::CliOverrides;

#[derive(Debug, Clone, Default, Args)]
pub struct DaemonArgs {
    /// TOML config file (default: <data dir>/conductor.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Engine executable (default: `opencode` on PATH)
    #[arg(long, value_name = "PATH")]
    pub engine_bin: Option<PathBuf>,

    /// Host the engine binds to
    #[arg(long, value_name = "HOST")]
    pub engine_host: Option<String>,

    /// Fixed engine port (default: a free port per spawn)
    #[arg(long, value_name = "PORT")]
    pub engine_port: Option<u16>,

    /// Working directory of the engine process (default: data dir)
    #[arg(long, value_name = "DIR")]
    pub engine_workdir: Option<PathBuf>,

    /// How long to wait for a spawned engine to become healthy
    #[arg(long, value_name = "MS")]
    pub startup_timeout_ms: Option<u64>,

    /// Timeout for path and dispose calls to the engine
    #[arg(long, value_name = "MS")]
    pub request_timeout_ms: Option<u64>,

    /// Dispose local instances idle for this many seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    pub idle_dispose_after: Option<u64>,
}

impl DaemonArgs {
    pub fn apply(&self, overrides: &mut CliOverrides) {
        overrides.config = self.config.clone();
        overrides.engine_bin = self.engine_bin.clone();
        overrides.engine_host = self.engine_host.clone();
        overrides.engine_port = self.engine_port;
        overrides.engine_workdir = self.engine_workdir.clone();
        overrides.startup_timeout_ms = self.startup_timeout_ms;
        overrides.request_timeout_ms = self.request_timeout_ms;
        overrides.idle_dispose_after_secs = self.idle_dispose_after;
    }

    /// Render back into command-line form for re-exec.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        };
        push("--config", self.config.as_ref().map(|p| p.display().to_string()));
        push(
            "--engine-bin",
            self.engine_bin.as_ref().map(|p| p.display().to_string()),
        );
        push("--engine-host", self.engine_host.clone());
        push("--engine-port", self.engine_port.map(|p| p.to_string()));
        push(
            "--engine-workdir",
            self.engine_workdir.as_ref().map(|p| p.display().to_string()),
        );
        push(
            "--startup-timeout-ms",
            self.startup_timeout_ms.map(|v| v.to_string()),
        );
        push(
            "--request-timeout-ms",
            self.request_timeout_ms.map(|v| v.to_string()),
        );
        push(
            "--idle-dispose-after",
            self.idle_dispose_after.map(|v| v.to_string()),
        );
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        daemon: DaemonArgs,
    }

    #[test]
    fn to_args_round_trips_through_clap() {
        let original = DaemonArgs {
            engine_bin: Some(PathBuf::from("/opt/engine")),
            engine_port: Some(4096),
            startup_timeout_ms: Some(500),
            idle_dispose_after: Some(60),
            ..DaemonArgs::default()
        };
        let mut argv = vec!["harness".to_string()];
        argv.extend(original.to_args());
        let parsed = Harness::parse_from(argv).daemon;

        assert_eq!(parsed.engine_bin, original.engine_bin);
        assert_eq!(parsed.engine_port, Some(4096));
        assert_eq!(parsed.startup_timeout_ms, Some(500));
        assert_eq!(parsed.idle_dispose_after, Some(60));
        assert!(parsed.config.is_none());

        let mut overrides = CliOverrides::default();
        parsed.apply(&mut overrides);
        assert_eq!(overrides.engine_port, Some(4096));
        assert_eq!(overrides.idle_dispose_after_secs, Some(60));
    }
}
