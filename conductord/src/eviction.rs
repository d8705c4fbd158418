//! Optional idle-instance eviction.
//!
//! Disposes the engine instance of local workspaces that have not been used
//! for a configured duration. Eviction times are kept in memory only, so a
//! workspace is evicted at most once per period of use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conductor_common::{now_ms, Workspace};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::router::InstanceRouter;
use crate::store::StateStore;
use crate::supervisor::EngineProvider;

const MAX_TICK: Duration = Duration::from_secs(30);

/// Ids of local workspaces idle for at least `threshold` that were used
/// after their last eviction.
pub fn select_idle(
    workspaces: &[Workspace],
    evicted_at: &HashMap<String, u64>,
    now: u64,
    threshold: Duration,
) -> Vec<String> {
    let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
    let cutoff = now.saturating_sub(threshold_ms);

    workspaces
        .iter()
        .filter(|workspace| workspace.is_local())
        .filter(|workspace| workspace.last_used_at <= cutoff)
        .filter(|workspace| {
            evicted_at
                .get(&workspace.id)
                .map(|evicted| workspace.last_used_at > *evicted)
                .unwrap_or(true)
        })
        .map(|workspace| workspace.id.clone())
        .collect()
}

pub fn spawn_idle_eviction_task(
    store: Arc<StateStore>,
    router: Arc<InstanceRouter>,
    engine: Arc<dyn EngineProvider>,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut evicted_at: HashMap<String, u64> = HashMap::new();
        let mut ticker = tokio::time::interval(threshold.min(MAX_TICK));
        ticker.tick().await;
        info!(
            idle_after_secs = threshold.as_secs(),
            "Idle instance eviction enabled"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if engine.current().await.is_none() {
                debug!("Engine not running; skipping eviction tick");
                continue;
            }

            let doc = store.snapshot().await;
            evicted_at.retain(|id, _| doc.workspace(id).is_some());
            let now = now_ms();

            for id in select_idle(&doc.workspaces, &evicted_at, now, threshold) {
                let Some(workspace) = doc.workspace(&id) else {
                    continue;
                };
                match router.dispose_workspace(workspace).await {
                    Ok(disposed) => {
                        info!(workspace_id = %id, disposed, "Evicted idle instance");
                        evicted_at.insert(id, now);
                    }
                    Err(err) => {
                        warn!(workspace_id = %id, error = %err, "Idle eviction failed; will retry");
                    }
                }
            }
        }
    })
}
