// # -----------------------------
// # crates/cli/src/main.rs
// # -----------------------------
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand};
use conductor_common::config::{resolve_client_config, CliOverrides};
use conductor_common::paths::absolutize;
use conductord::args::DaemonArgs;
use conductord_client::ControlClient;
use tracing::debug;

mod daemon_ctl;
mod output;

use output::{print_error, workspace_details, workspace_line, Rendered};

#[derive(Parser, Debug)]
#[command(
    name = "conductor",
    version,
    about = "Conductor - one engine, many workspaces",
    long_about = None
)]
struct Cli {
    /// Print a single JSON object on stdout (errors as {"error": ..})
    #[arg(long, global = true)]
    json: bool,
    /// Data directory (default: $CONDUCTOR_DATA_DIR or ~/.conductor)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Control-plane host
    #[arg(long, global = true, value_name = "HOST")]
    daemon_host: Option<String>,
    /// Control-plane port
    #[arg(long, global = true, value_name = "PORT")]
    daemon_port: Option<u16>,
    /// Bearer token for the control plane
    #[arg(long, global = true, value_name = "TOKEN")]
    token: Option<String>,
    /// Enable debug logging on stderr
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Manage registered workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    /// Manage engine instances
    Instance {
        #[command(subcommand)]
        command: InstanceCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Run the daemon in the foreground
    Run {
        #[command(flatten)]
        args: DaemonArgs,
    },
    /// Start the daemon in the background
    Start {
        #[command(flatten)]
        args: DaemonArgs,
        /// How long to wait for the daemon to answer
        #[arg(long, default_value_t = 20_000, value_name = "MS")]
        wait_ms: u64,
    },
    /// Stop the daemon and its engine
    Stop {
        /// How long to wait for the daemon to exit
        #[arg(long, default_value_t = 10_000, value_name = "MS")]
        wait_ms: u64,
    },
    /// Show daemon and engine status
    Status,
}

#[derive(Subcommand, Debug)]
enum WorkspaceCommand {
    /// Register a local directory
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Register a remote engine endpoint
    AddRemote {
        base_url: String,
        #[arg(long)]
        directory: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// List workspaces (active one marked with *)
    List,
    /// Make a workspace the active one
    Switch { id: String },
    /// Show one workspace
    Info { id: String },
    /// Resolve the engine path info for a workspace (default: active)
    Path { id: Option<String> },
    /// Change a workspace's display name
    Rename { id: String, name: String },
    /// Remove a workspace from the registry (its instance is left alone)
    #[command(alias = "remove")]
    Forget { id: String },
}

#[derive(Subcommand, Debug)]
enum InstanceCommand {
    /// Dispose the engine instance of a workspace (default: active)
    Dispose { id: Option<String> },
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let json_requested = argv.iter().any(|arg| arg == "--json");

    let cli = match Cli::try_parse_from(&argv) {
        Ok(cli) => cli,
        Err(err) => {
            if matches!(
                err.kind(),
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion
            ) {
                let _ = err.print();
                return ExitCode::SUCCESS;
            }
            if json_requested {
                let message = err.to_string();
                let first = message.lines().next().unwrap_or("invalid arguments");
                print_error(true, first.trim_start_matches("error: "));
            } else {
                let _ = err.print();
            }
            return ExitCode::from(2);
        }
    };

    conductord::init_tracing(cli.debug, "warn");
    debug!(
        "{}",
        conductor_build_info::banner("conductor", env!("CARGO_PKG_VERSION"))
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            print_error(cli.json, &format!("failed to start runtime: {}", err));
            return ExitCode::FAILURE;
        }
    };

    let json_mode = cli.json;
    match runtime.block_on(dispatch(cli)) {
        Ok(rendered) => {
            rendered.print(json_mode);
            ExitCode::SUCCESS
        }
        Err(err) => {
            print_error(json_mode, &format!("{:#}", err));
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<Rendered> {
    let mut overrides = CliOverrides {
        data_dir: cli.data_dir.clone(),
        daemon_host: cli.daemon_host.clone(),
        daemon_port: cli.daemon_port,
        token: cli.token.clone(),
        ..CliOverrides::default()
    };
    // The daemon's config file also decides where the client looks for it.
    if let Commands::Daemon {
        command: DaemonCommand::Run { args } | DaemonCommand::Start { args, .. },
    } = &cli.command
    {
        overrides.config = args.config.clone();
    }

    let config = resolve_client_config(&overrides, |key| std::env::var(key).ok())?;
    let client = ControlClient::from_config(&config)?;

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommand::Run { args } => daemon_ctl::run_foreground(overrides, &args).await,
            DaemonCommand::Start { args, wait_ms } => {
                daemon_ctl::start(
                    &client,
                    &config,
                    &args,
                    cli.debug,
                    Duration::from_millis(wait_ms),
                )
                .await
            }
            DaemonCommand::Stop { wait_ms } => {
                daemon_ctl::stop(&client, Duration::from_millis(wait_ms)).await
            }
            DaemonCommand::Status => daemon_ctl::status(&client).await,
        },
        Commands::Workspace { command } => workspace(&client, command).await,
        Commands::Instance { command } => match command {
            InstanceCommand::Dispose { id } => {
                let id = resolve_id(&client, id).await?;
                let response = client.dispose(&id).await?;
                let human = if response.disposed {
                    format!("disposed instance of {}", response.id)
                } else {
                    format!("no live instance for {}", response.id)
                };
                Ok(Rendered::new(&response, human))
            }
        },
    }
}

async fn workspace(client: &ControlClient, command: WorkspaceCommand) -> Result<Rendered> {
    match command {
        WorkspaceCommand::Add { path, name } => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            let absolute = absolutize(&path, &cwd);
            let path = absolute
                .to_str()
                .context("workspace path is not valid UTF-8")?;
            let response = client.add(path, name.as_deref()).await?;
            let verb = if response.created { "added" } else { "already registered" };
            let human = format!(
                "{} {} ({})",
                verb, response.workspace.id, response.workspace.path
            );
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::AddRemote {
            base_url,
            directory,
            name,
        } => {
            let response = client
                .add_remote(&base_url, directory.as_deref(), name.as_deref())
                .await?;
            let verb = if response.created { "added" } else { "already registered" };
            let human = format!(
                "{} {} ({})",
                verb, response.workspace.id, response.workspace.name
            );
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::List => {
            let response = client.list().await?;
            let human = if response.workspaces.is_empty() {
                "no workspaces registered".to_string()
            } else {
                response
                    .workspaces
                    .iter()
                    .map(|ws| workspace_line(ws, response.active_id.as_deref() == Some(&ws.id)))
                    .collect::<Vec<_>>()
                    .join("\n")
            };
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::Switch { id } => {
            let response = client.activate(&id).await?;
            let human = format!(
                "active workspace: {} ({})",
                response.active_id, response.workspace.name
            );
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::Info { id } => {
            let response = client.get(&id).await?;
            let human = workspace_details(&response.workspace);
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::Path { id } => {
            let id = resolve_id(client, id).await?;
            let response = client.workspace_path(&id).await?;
            let human = response
                .path
                .get("directory")
                .and_then(|dir| dir.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| response.path.to_string());
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::Rename { id, name } => {
            let response = client.rename(&id, &name).await?;
            let human = format!(
                "renamed {} to {}",
                response.workspace.id, response.workspace.name
            );
            Ok(Rendered::new(&response, human))
        }
        WorkspaceCommand::Forget { id } => {
            let response = client.forget(&id).await?;
            let human = format!("forgot {}", response.id);
            Ok(Rendered::new(&response, human))
        }
    }
}

/// `None` or `active` means the daemon's active workspace.
async fn resolve_id(client: &ControlClient, id: Option<String>) -> Result<String> {
    match id {
        Some(id) if id != "active" => Ok(id),
        _ => match client.list().await?.active_id {
            Some(active) => Ok(active),
            None => bail!("no active workspace; pass an id or run `conductor workspace switch`"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "conductor",
            "workspace",
            "path",
            "ws-1",
            "--json",
            "--daemon-port",
            "9000",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.daemon_port, Some(9000));
    }

    #[test]
    fn remove_is_an_alias_for_forget() {
        let cli = Cli::try_parse_from(["conductor", "workspace", "remove", "ws-1"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Workspace {
                command: WorkspaceCommand::Forget { .. }
            }
        ));
    }
}
