//! Rendering of command results: one JSON object with `--json`, plain lines
//! otherwise.

use conductor_common::{HealthResponse, Workspace};
use serde::Serialize;
use serde_json::{json, Value};

/// A command result in both output modes.
pub struct Rendered {
    pub json: Value,
    pub human: String,
}

impl Rendered {
    pub fn new(body: &impl Serialize, human: impl Into<String>) -> Self {
        Self {
            json: serde_json::to_value(body).unwrap_or(Value::Null),
            human: human.into(),
        }
    }

    pub fn print(&self, json_mode: bool) {
        if json_mode {
            println!("{}", self.json);
        } else if !self.human.is_empty() {
            println!("{}", self.human);
        }
    }
}

pub fn print_error(json_mode: bool, message: &str) {
    if json_mode {
        println!("{}", json!({ "error": message }));
    } else {
        eprintln!("error: {}", message);
    }
}

pub fn workspace_line(workspace: &Workspace, active: bool) -> String {
    let marker = if active { "*" } else { " " };
    let location = match (&workspace.base_url, &workspace.directory) {
        (Some(base), Some(dir)) => format!("{} {}", base, dir),
        (Some(base), None) => base.clone(),
        _ => workspace.path.clone(),
    };
    format!(
        "{} {}  {}  [{}]  {}",
        marker, workspace.id, workspace.name, workspace.workspace_type, location
    )
}

pub fn workspace_details(workspace: &Workspace) -> String {
    let mut lines = vec![
        format!("id:        {}", workspace.id),
        format!("name:      {}", workspace.name),
        format!("type:      {}", workspace.workspace_type),
    ];
    if workspace.is_local() {
        lines.push(format!("path:      {}", workspace.path));
    }
    if let Some(base) = &workspace.base_url {
        lines.push(format!("baseUrl:   {}", base));
    }
    if let Some(dir) = &workspace.directory {
        lines.push(format!("directory: {}", dir));
    }
    lines.push(format!("lastUsed:  {}", workspace.last_used_at));
    lines.join("\n")
}

pub fn health_summary(health: &HealthResponse) -> String {
    let mut lines = vec![format!(
        "daemon:    running (version {}, data dir {})",
        health.version, health.data_dir
    )];
    if let Some(daemon) = &health.daemon {
        lines.push(format!("           pid {} at {}", daemon.pid, daemon.base_url));
    }
    let engine = match (&health.engine, health.engine_running, health.engine_starting) {
        (_, _, true) => "starting".to_string(),
        (Some(engine), true, _) => format!("running (pid {} at {})", engine.pid, engine.base_url),
        _ => "not running".to_string(),
    };
    lines.push(format!("engine:    {}", engine));
    if let Some(binary) = health.binaries.as_ref().and_then(|b| b.engine.as_ref()) {
        let version = binary.actual_version.as_deref().unwrap_or("unknown version");
        lines.push(format!("binary:    {} ({})", binary.path, version));
    }
    lines.push(format!(
        "workspaces: {} (active: {})",
        health.workspace_count,
        health.active_id.as_deref().unwrap_or("none")
    ));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::WorkspaceType;

    #[test]
    fn active_workspace_is_marked() {
        let workspace = Workspace {
            id: "ws-1".into(),
            name: "one".into(),
            workspace_type: WorkspaceType::Local,
            path: "/srv/one".into(),
            base_url: None,
            directory: None,
            created_at: 0,
            last_used_at: 0,
        };
        assert!(workspace_line(&workspace, true).starts_with("* ws-1"));
        assert!(workspace_line(&workspace, false).ends_with("/srv/one"));
    }
}
