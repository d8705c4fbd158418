use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use conductor_common::config::{resolve_daemon_config, CliOverrides};
use conductord::args::DaemonArgs;

#[derive(Parser, Debug)]
#[command(name = "conductord")]
#[command(about = "Conductor orchestration daemon", version)]
struct Cli {
    /// Data directory (state file, logs, lock)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Control-plane bind host (loopback only)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Control-plane port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Require `Authorization: Bearer <token>` on the control plane
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(flatten)]
    daemon: DaemonArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    conductord::init_tracing(cli.debug, "info");

    let mut overrides = CliOverrides {
        data_dir: cli.data_dir,
        daemon_host: cli.host,
        daemon_port: cli.port,
        token: cli.token,
        ..CliOverrides::default()
    };
    cli.daemon.apply(&mut overrides);

    let config = resolve_daemon_config(&overrides, |key| std::env::var(key).ok())?;
    conductord::run(config).await
}
