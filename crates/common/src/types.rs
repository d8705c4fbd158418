//! Data model shared by the daemon, the control-plane client and the CLI.
//!
//! Everything here is serialized as camelCase JSON: the state document on
//! disk and the control-plane request/response bodies use the same shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current schema version of [`StateDocument`].
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    Local,
    Remote,
}

impl std::fmt::Display for WorkspaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceType::Local => f.write_str("local"),
            WorkspaceType::Remote => f.write_str("remote"),
        }
    }
}

/// A registered local directory or remote engine endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub workspace_type: WorkspaceType,
    /// Normalized absolute directory for local workspaces; empty for remote.
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub last_used_at: u64,
}

impl Workspace {
    pub fn is_local(&self) -> bool {
        self.workspace_type == WorkspaceType::Local
    }

    /// The `directory` value sent to the engine when routing to this workspace.
    pub fn engine_directory(&self) -> Option<&str> {
        match self.workspace_type {
            WorkspaceType::Local => Some(self.path.as_str()),
            WorkspaceType::Remote => self.directory.as_deref(),
        }
    }
}

/// Identity of a process owned by the daemon (the daemon itself or the engine).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    pub port: u16,
    pub base_url: String,
    pub started_at: u64,
    /// Kernel start time of `pid`, guards against pid reuse when checking liveness.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BinarySource {
    Flag,
    Env,
    Config,
    Path,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BinaryInfo {
    pub path: String,
    pub source: BinarySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BinaryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<BinaryInfo>,
}

/// The on-disk aggregate owned by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon: Option<ProcessRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<ProcessRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binaries: Option<BinaryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_id: Option<String>,
    #[serde(default)]
    pub workspaces: Vec<Workspace>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cli_version: None,
            daemon: None,
            engine: None,
            binaries: None,
            active_id: None,
            workspaces: Vec::new(),
        }
    }
}

impl StateDocument {
    pub fn workspace(&self, id: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|workspace| workspace.id == id)
    }

    pub fn workspace_mut(&mut self, id: &str) -> Option<&mut Workspace> {
        self.workspaces.iter_mut().find(|workspace| workspace.id == id)
    }
}

// --- control-plane bodies -----------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddWorkspaceRequest {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRemoteWorkspaceRequest {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameWorkspaceRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddWorkspaceResponse {
    pub workspace: Workspace,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResponse {
    pub workspace: Workspace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceListResponse {
    pub active_id: Option<String>,
    pub workspaces: Vec<Workspace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateResponse {
    pub active_id: String,
    pub workspace: Workspace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetResponse {
    pub id: String,
    pub removed: bool,
}

/// Result of routing a path-resolution call; `path` is the engine's body, untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResponse {
    pub workspace: Workspace,
    pub path: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisposeResponse {
    pub id: String,
    pub disposed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub version: String,
    #[serde(default)]
    pub cli_version: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
    pub data_dir: String,
    pub daemon: Option<ProcessRecord>,
    pub engine: Option<ProcessRecord>,
    pub engine_running: bool,
    #[serde(default)]
    pub engine_starting: bool,
    #[serde(default)]
    pub binaries: Option<BinaryState>,
    pub active_id: Option<String>,
    pub workspace_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownResponse {
    pub ok: bool,
}

/// Error body returned by every failing control-plane endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_document_tolerates_missing_and_unknown_fields() {
        let raw = json!({
            "workspaces": [{
                "id": "ws-1",
                "name": "one",
                "workspaceType": "local",
                "path": "/tmp/one",
                "sidecar": { "dir": "/ignored" }
            }],
            "futureField": true
        });
        let doc: StateDocument = serde_json::from_value(raw).expect("parse state");
        assert_eq!(doc.version, 0);
        assert_eq!(doc.workspaces.len(), 1);
        assert_eq!(doc.workspaces[0].last_used_at, 0);
        assert!(doc.active_id.is_none());
    }

    #[test]
    fn remote_workspace_routes_to_its_directory() {
        let workspace = Workspace {
            id: "ws-r".into(),
            name: "remote".into(),
            workspace_type: WorkspaceType::Remote,
            path: String::new(),
            base_url: Some("http://10.0.0.2:4096".into()),
            directory: Some("/srv/app".into()),
            created_at: 1,
            last_used_at: 1,
        };
        assert_eq!(workspace.engine_directory(), Some("/srv/app"));
        assert!(!workspace.is_local());

        let value = serde_json::to_value(&workspace).unwrap();
        assert_eq!(value["workspaceType"], "remote");
        assert_eq!(value["baseUrl"], "http://10.0.0.2:4096");
    }
}
