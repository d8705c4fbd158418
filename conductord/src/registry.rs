//! Workspace registry: CRUD over the workspace list in the state document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use conductor_common::paths::expand_tilde;
use conductor_common::{
    now_ms, ConductorError, ConductorResult, StateDocument, Workspace, WorkspaceType,
};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::store::StateStore;

const ID_HEX_LEN: usize = 16;

/// Result of an idempotent add.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub workspace: Workspace,
    pub created: bool,
}

pub struct Registry {
    store: Arc<StateStore>,
}

impl Registry {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Register a local directory. Re-adding the same directory returns the
    /// existing entry.
    pub async fn add(&self, path: &str, name: Option<&str>) -> ConductorResult<AddOutcome> {
        let normalized = normalize_local_path(path)?;
        let path = normalized
            .to_str()
            .ok_or_else(|| ConductorError::invalid("workspace path is not valid UTF-8"))?
            .to_string();
        let id = workspace_id(&path);
        let default_name = normalized
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        let candidate = Workspace {
            id,
            name: default_name,
            workspace_type: WorkspaceType::Local,
            path,
            base_url: None,
            directory: None,
            created_at: 0,
            last_used_at: 0,
        };
        self.insert_or_touch(candidate, clean_name(name)).await
    }

    /// Register a remote engine endpoint, optionally scoped to a directory.
    pub async fn add_remote(
        &self,
        base_url: &str,
        directory: Option<&str>,
        name: Option<&str>,
    ) -> ConductorResult<AddOutcome> {
        let (base_url, host) = normalize_base_url(base_url)?;
        let directory = directory
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(str::to_string);

        let key = match &directory {
            Some(dir) => format!("remote::{}::{}", base_url, dir),
            None => format!("remote::{}", base_url),
        };
        let default_name = match &directory {
            Some(dir) => format!("{} {}", host, dir),
            None => host,
        };

        let candidate = Workspace {
            id: workspace_id(&key),
            name: default_name,
            workspace_type: WorkspaceType::Remote,
            path: String::new(),
            base_url: Some(base_url),
            directory,
            created_at: 0,
            last_used_at: 0,
        };
        self.insert_or_touch(candidate, clean_name(name)).await
    }

    async fn insert_or_touch(
        &self,
        mut candidate: Workspace,
        name: Option<String>,
    ) -> ConductorResult<AddOutcome> {
        let outcome = self
            .store
            .with_lock(move |doc| {
                let now = now_ms();
                if let Some(existing) = doc.workspace_mut(&candidate.id) {
                    existing.last_used_at = now;
                    if let Some(name) = name {
                        existing.name = name;
                    }
                    return Ok(AddOutcome {
                        workspace: existing.clone(),
                        created: false,
                    });
                }

                if let Some(name) = name {
                    candidate.name = name;
                }
                candidate.created_at = now;
                candidate.last_used_at = now;
                doc.workspaces.push(candidate.clone());
                Ok(AddOutcome {
                    workspace: candidate,
                    created: true,
                })
            })
            .await?;

        if outcome.created {
            info!(
                workspace_id = %outcome.workspace.id,
                workspace_type = %outcome.workspace.workspace_type,
                "Workspace added"
            );
        }
        Ok(outcome)
    }

    /// `(activeId, workspaces)` in insertion order.
    pub async fn list(&self) -> (Option<String>, Vec<Workspace>) {
        let doc = self.store.snapshot().await;
        (doc.active_id, doc.workspaces)
    }

    pub async fn get(&self, id: &str) -> ConductorResult<Workspace> {
        self.store
            .snapshot()
            .await
            .workspace(id)
            .cloned()
            .ok_or_else(|| ConductorError::NotFound(id.to_string()))
    }

    pub async fn activate(&self, id: &str) -> ConductorResult<Workspace> {
        let workspace = self
            .store
            .with_lock(|doc| {
                let workspace = find_mut(doc, id)?;
                workspace.last_used_at = now_ms();
                let workspace = workspace.clone();
                doc.active_id = Some(workspace.id.clone());
                Ok(workspace)
            })
            .await?;
        info!(workspace_id = %workspace.id, "Workspace activated");
        Ok(workspace)
    }

    pub async fn update_display_name(&self, id: &str, name: &str) -> ConductorResult<Workspace> {
        let name = clean_name(Some(name))
            .ok_or_else(|| ConductorError::invalid("workspace name must not be empty"))?;
        self.store
            .with_lock(|doc| {
                let workspace = find_mut(doc, id)?;
                workspace.name = name;
                Ok(workspace.clone())
            })
            .await
    }

    /// Drop the entry. The engine instance, if any, is left alone.
    pub async fn forget(&self, id: &str) -> ConductorResult<Workspace> {
        let removed = self
            .store
            .with_lock(|doc| {
                let index = doc
                    .workspaces
                    .iter()
                    .position(|workspace| workspace.id == id)
                    .ok_or_else(|| ConductorError::NotFound(id.to_string()))?;
                let removed = doc.workspaces.remove(index);
                if doc.active_id.as_deref() == Some(id) {
                    doc.active_id = None;
                }
                Ok(removed)
            })
            .await?;
        info!(workspace_id = %removed.id, "Workspace forgotten");
        Ok(removed)
    }

    /// Record a routed request against `id`.
    pub async fn touch(&self, id: &str) -> ConductorResult<()> {
        self.store
            .with_lock(|doc| {
                find_mut(doc, id)?.last_used_at = now_ms();
                Ok(())
            })
            .await
    }
}

fn find_mut<'a>(doc: &'a mut StateDocument, id: &str) -> ConductorResult<&'a mut Workspace> {
    doc.workspace_mut(id)
        .ok_or_else(|| ConductorError::NotFound(id.to_string()))
}

fn clean_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// `ws-` followed by the first 16 hex chars of SHA-256 over `key`.
pub fn workspace_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let hex = hex::encode(digest);
    format!("ws-{}", &hex[..ID_HEX_LEN])
}

/// Tilde-expand, require an absolute path, clean it and resolve symlinks.
/// The directory must already exist.
pub fn normalize_local_path(raw: &str) -> ConductorResult<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConductorError::invalid("workspace path must not be empty"));
    }

    let expanded = expand_tilde(PathBuf::from(trimmed));
    if !expanded.is_absolute() {
        return Err(ConductorError::invalid(format!(
            "workspace path '{}' must be absolute",
            trimmed
        )));
    }

    let cleaned = conductor_common::paths::absolutize(&expanded, Path::new("/"));
    let canonical = std::fs::canonicalize(&cleaned).map_err(|err| {
        ConductorError::invalid(format!("workspace path '{}': {}", cleaned.display(), err))
    })?;
    if !canonical.is_dir() {
        return Err(ConductorError::invalid(format!(
            "workspace path '{}' is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Validate an `http`/`https` base URL. Returns the normalized URL (no
/// trailing slash) and its `host[:port]` for display.
pub fn normalize_base_url(raw: &str) -> ConductorResult<(String, String)> {
    let trimmed = raw.trim();
    let url = reqwest::Url::parse(trimmed).map_err(|err| {
        ConductorError::invalid(format!("invalid base URL '{}': {}", trimmed, err))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConductorError::invalid(format!(
            "base URL '{}' must use http or https",
            trimmed
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ConductorError::invalid(format!("base URL '{}' has no host", trimmed)))?;
    let display = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let normalized = url.as_str().trim_end_matches('/').to_string();
    Ok((normalized, display))
}
