//! A stand-in engine.
//!
//! Serves the three endpoints the daemon relies on. Instances are created
//! lazily by the first `/path` call for a directory and removed by
//! `/instance/dispose`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::{
    extract::{Extension, Query},
    routing::{get, post},
    Json, Router,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone, Default)]
struct Instances {
    /// directory -> creation time (ms)
    inner: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl Instances {
    fn open(&self, directory: &str) -> bool {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.contains_key(directory) {
            return false;
        }
        guard.insert(directory.to_string(), now_ms());
        true
    }

    fn dispose(&self, directory: &str) -> bool {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.remove(directory).is_some()
    }

    fn list(&self) -> Vec<String> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.keys().cloned().collect()
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryQuery {
    directory: Option<String>,
}

impl DirectoryQuery {
    fn resolve(self) -> String {
        self.directory.unwrap_or_else(|| {
            std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|_| ".".to_string())
        })
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/global/health", get(health))
        .route("/path", get(path))
        .route("/instance", get(list_instances))
        .route("/instance/dispose", post(dispose))
        .layer(Extension(Instances::default()))
}

/// Serve [`router`] on an already-bound listener until the task is dropped.
pub async fn serve(listener: TcpListener) -> std::io::Result<()> {
    axum::serve(listener, router().into_make_service()).await
}

async fn health() -> Json<Value> {
    Json(json!({ "healthy": true, "version": env!("CARGO_PKG_VERSION") }))
}

async fn path(
    Extension(instances): Extension<Instances>,
    Query(query): Query<DirectoryQuery>,
) -> Json<Value> {
    let directory = query.resolve();
    if instances.open(&directory) {
        info!(%directory, "Instance created");
    }
    Json(json!({
        "directory": directory,
        "worktree": directory,
        "state": format!("{}/.engine/state", directory),
        "config": format!("{}/.engine/config", directory),
    }))
}

async fn list_instances(Extension(instances): Extension<Instances>) -> Json<Value> {
    Json(json!({ "instances": instances.list() }))
}

async fn dispose(
    Extension(instances): Extension<Instances>,
    Query(query): Query<DirectoryQuery>,
) -> Json<Value> {
    let directory = query.resolve();
    let disposed = instances.dispose(&directory);
    if disposed {
        info!(%directory, "Instance disposed");
    }
    Json(json!({ "disposed": disposed }))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Parser, Debug)]
#[command(name = "conductor-engine-stub", version)]
#[command(about = "Minimal engine for exercising the conductor daemon")]
pub struct StubCli {
    #[command(subcommand)]
    pub command: StubCommand,
}

#[derive(Subcommand, Debug)]
pub enum StubCommand {
    /// Serve the engine HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 4096)]
        port: u16,
    },
}

pub async fn run(cli: StubCli) -> Result<()> {
    match cli.command {
        StubCommand::Serve { hostname, port } => {
            let listener = TcpListener::bind((hostname.as_str(), port))
                .await
                .with_context(|| format!("Failed to bind {}:{}", hostname, port))?;
            info!(%hostname, port, pid = std::process::id(), "Engine stub listening");
            serve(listener).await.context("Engine stub server failed")
        }
    }
}
