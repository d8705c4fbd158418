//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conductor_common::process_utils::find_free_port;
use conductor_common::{ConductorResult, ProcessRecord};
use tokio::net::TcpListener;

use crate::supervisor::{EngineProvider, EngineStatus};

/// Hands out `urls[n]` on the n-th `ensure_running` call; the last one repeats.
pub(crate) struct FixedEngine {
    urls: Vec<String>,
    calls: AtomicUsize,
}

impl FixedEngine {
    pub(crate) fn new(urls: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            urls,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self, index: usize) -> ProcessRecord {
        ProcessRecord {
            pid: std::process::id(),
            port: 0,
            base_url: self.urls[index.min(self.urls.len() - 1)].clone(),
            started_at: 0,
            start_ticks: None,
        }
    }
}

#[async_trait]
impl EngineProvider for FixedEngine {
    async fn ensure_running(&self) -> ConductorResult<ProcessRecord> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.record(n))
    }

    async fn status(&self) -> EngineStatus {
        EngineStatus {
            running: true,
            starting: false,
            record: Some(self.record(self.calls())),
        }
    }
}

/// Serve the stub engine on an ephemeral loopback port.
pub(crate) async fn start_stub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(conductor_engine_stub::serve(listener));
    format!("http://{addr}")
}

/// A loopback URL nothing listens on.
pub(crate) fn dead_url() -> String {
    format!("http://127.0.0.1:{}", find_free_port("127.0.0.1").unwrap())
}
