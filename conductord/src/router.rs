//! Routes workspace operations to the right engine instance.
//!
//! Local workspaces go to the supervised engine with `directory` set to the
//! workspace path; remote workspaces go to their own base URL. Instances are
//! created lazily by the engine and never tracked here.

use std::future::Future;
use std::sync::Arc;

use conductor_common::{ConductorError, ConductorResult, PathResponse, Workspace};
use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::{EngineClient, EngineError};
use crate::registry::Registry;
use crate::supervisor::EngineProvider;

pub struct InstanceRouter {
    registry: Arc<Registry>,
    engine: Arc<dyn EngineProvider>,
    client: EngineClient,
}

impl InstanceRouter {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn EngineProvider>,
        client: EngineClient,
    ) -> Self {
        Self {
            registry,
            engine,
            client,
        }
    }

    /// Ask the workspace's engine instance for its path info, creating the
    /// instance on first use.
    pub async fn resolve_path(&self, id: &str) -> ConductorResult<PathResponse> {
        let workspace = self.registry.get(id).await?;
        let directory = workspace.engine_directory().map(str::to_string);
        let client = self.client.clone();

        let path: Value = self
            .route(&workspace, |base_url| {
                let client = client.clone();
                let directory = directory.clone();
                async move { client.path(&base_url, directory.as_deref()).await }
            })
            .await?;

        self.touch(&workspace.id).await;
        Ok(PathResponse { workspace, path })
    }

    /// Dispose the workspace's engine instance. The registry entry stays.
    pub async fn dispose(&self, id: &str) -> ConductorResult<bool> {
        let workspace = self.registry.get(id).await?;
        let disposed = self.dispose_workspace(&workspace).await?;
        self.touch(&workspace.id).await;
        Ok(disposed)
    }

    /// Dispose without counting as use; idle eviction calls this.
    pub async fn dispose_workspace(&self, workspace: &Workspace) -> ConductorResult<bool> {
        let directory = workspace.engine_directory().map(str::to_string);
        let client = self.client.clone();
        self.route(workspace, |base_url| {
            let client = client.clone();
            let directory = directory.clone();
            async move { client.dispose(&base_url, directory.as_deref()).await }
        })
        .await
    }

    /// Send one engine call. Local targets get a single ensure-running retry
    /// on transport failure; remote targets get none.
    async fn route<T, F, Fut>(&self, workspace: &Workspace, call: F) -> ConductorResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if !workspace.is_local() {
            let base_url = workspace.base_url.clone().ok_or_else(|| {
                ConductorError::Fatal(format!("remote workspace {} has no baseUrl", workspace.id))
            })?;
            return call(base_url).await.map_err(ConductorError::from);
        }

        let record = self.engine.ensure_running().await?;
        match call(record.base_url).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_transport() => {
                warn!(
                    workspace_id = %workspace.id,
                    error = %err,
                    "Engine unreachable; ensuring it is running and retrying once"
                );
                let record = self.engine.ensure_running().await?;
                call(record.base_url).await.map_err(ConductorError::from)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn touch(&self, id: &str) {
        if let Err(err) = self.registry.touch(id).await {
            match err {
                ConductorError::NotFound(_) => {
                    debug!(workspace_id = %id, "Workspace forgotten while routing")
                }
                other => warn!(
                    workspace_id = %id,
                    error = %other,
                    "Failed to record workspace use"
                ),
            }
        }
    }
}
