//! Durable state document owned by the daemon.
//!
//! All mutations go through [`StateStore::with_lock`]: the closure edits a
//! copy, the copy is written atomically, and only a successful write is
//! committed to memory. Readers take [`StateStore::snapshot`].

use std::path::{Path, PathBuf};

use conductor_common::fs::write_json_atomic;
use conductor_common::{now_ms, ConductorError, ConductorResult, StateDocument, STATE_VERSION};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct StateStore {
    path: PathBuf,
    doc: Mutex<StateDocument>,
}

impl StateStore {
    /// Load the document at `path` (see [`load`]) and wrap it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = load(&path);
        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> StateDocument {
        self.doc.lock().await.clone()
    }

    /// Apply `mutate` under the store lock and persist the result.
    ///
    /// If `mutate` fails nothing is written. If the write fails the in-memory
    /// document is left untouched and `Fatal` is returned.
    pub async fn with_lock<T, F>(&self, mutate: F) -> ConductorResult<T>
    where
        F: FnOnce(&mut StateDocument) -> ConductorResult<T>,
    {
        let mut guard = self.doc.lock().await;
        let mut draft = guard.clone();
        let value = mutate(&mut draft)?;
        if draft != *guard {
            save(&self.path, &draft)?;
            *guard = draft;
        }
        Ok(value)
    }
}

/// Read the state file.
///
/// A missing file yields the default document. A file that cannot be read or
/// parsed is moved aside to `<file>.corrupt-<ms>` and replaced by the default
/// document; this is the one place state is knowingly dropped. Loading never
/// fails: if the bad file cannot be moved aside, the next save replaces it or
/// reports `Fatal` for that request.
pub fn load(path: &Path) -> StateDocument {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return StateDocument::default();
        }
        Err(err) => {
            error!(path = %path.display(), error = %err, "State file unreadable");
            quarantine(path);
            return StateDocument::default();
        }
    };

    let mut doc: StateDocument = match serde_json::from_slice(&raw) {
        Ok(doc) => doc,
        Err(err) => {
            error!(
                path = %path.display(),
                error = %err,
                "State file is corrupt; starting from an empty registry"
            );
            quarantine(path);
            return StateDocument::default();
        }
    };

    if doc.version < STATE_VERSION {
        info!(
            from = doc.version,
            to = STATE_VERSION,
            "Upgrading state document"
        );
        doc.version = STATE_VERSION;
    } else if doc.version > STATE_VERSION {
        warn!(
            version = doc.version,
            supported = STATE_VERSION,
            "State document was written by a newer release; unknown fields are ignored"
        );
    }

    doc
}

pub fn save(path: &Path, doc: &StateDocument) -> ConductorResult<()> {
    write_json_atomic(path, doc)
        .map_err(|err| ConductorError::fatal(&format!("failed to write {}", path.display()), err))
}

fn quarantine(path: &Path) -> Option<PathBuf> {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".corrupt-{}", now_ms()));
    let aside = PathBuf::from(name);
    match std::fs::rename(path, &aside) {
        Ok(()) => {
            warn!(moved_to = %aside.display(), "Corrupt state file preserved");
            Some(aside)
        }
        Err(err) => {
            error!(
                path = %path.display(),
                error = %err,
                "Failed to move corrupt state file aside; it will be overwritten"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::{Workspace, WorkspaceType};
    use tempfile::tempdir;

    fn workspace(id: &str) -> Workspace {
        Workspace {
            id: id.to_string(),
            name: id.to_string(),
            workspace_type: WorkspaceType::Local,
            path: format!("/tmp/{id}"),
            base_url: None,
            directory: None,
            created_at: 1,
            last_used_at: 1,
        }
    }

    #[tokio::test]
    async fn missing_file_yields_default_document() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("conductor-state.json"));
        let doc = store.snapshot().await;
        assert_eq!(doc.version, STATE_VERSION);
        assert!(doc.workspaces.is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn mutations_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor-state.json");
        let store = StateStore::open(&path);
        store
            .with_lock(|doc| {
                doc.workspaces.push(workspace("ws-a"));
                doc.active_id = Some("ws-a".into());
                Ok(())
            })
            .await
            .unwrap();

        let reopened = StateStore::open(&path);
        let doc = reopened.snapshot().await;
        assert_eq!(doc.workspaces.len(), 1);
        assert_eq!(doc.active_id.as_deref(), Some("ws-a"));
    }

    #[tokio::test]
    async fn failed_mutation_changes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor-state.json");
        let store = StateStore::open(&path);
        let err = store
            .with_lock(|doc| -> ConductorResult<()> {
                doc.workspaces.push(workspace("ws-a"));
                Err(ConductorError::invalid("nope"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        assert!(store.snapshot().await.workspaces.is_empty());
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_save_leaves_memory_untouched() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let store = StateStore::open(state_dir.join("conductor-state.json"));

        std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o500)).unwrap();
        let probe = state_dir.join("probe");
        if std::fs::write(&probe, b"x").is_ok() {
            // Running as root: permissions are not enforced, nothing to test.
            let _ = std::fs::remove_file(&probe);
            return;
        }

        let err = store
            .with_lock(|doc| {
                doc.workspaces.push(workspace("ws-a"));
                Ok(())
            })
            .await
            .unwrap_err();
        std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        assert_eq!(err.code(), "fatal");
        assert!(store.snapshot().await.workspaces.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_moved_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor-state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = StateStore::open(&path);
        assert!(store.snapshot().await.workspaces.is_empty());
        assert!(!path.exists());

        let preserved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("conductor-state.json.corrupt-")
            })
            .collect();
        assert_eq!(preserved.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn corrupt_file_that_cannot_be_moved_still_opens_empty() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let path = state_dir.join("conductor-state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o500)).unwrap();
        if std::fs::write(state_dir.join("writable"), b"x").is_ok() {
            // Running as root: the rename cannot be made to fail this way.
            std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o700)).unwrap();
            return;
        }

        let store = StateStore::open(&path);
        let doc = store.snapshot().await;
        std::fs::set_permissions(&state_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        assert_eq!(doc.version, STATE_VERSION);
        assert!(doc.workspaces.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn old_version_is_upgraded_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor-state.json");
        std::fs::write(&path, br#"{"version":0,"workspaces":[],"extra":1}"#).unwrap();
        let store = StateStore::open(&path);
        assert_eq!(store.snapshot().await.version, STATE_VERSION);
    }
}
