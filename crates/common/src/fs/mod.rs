//! Durable file helpers for daemon-owned state.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Create `dir` (and parents) readable only by the current user.
#[cfg(unix)]
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Persist `value` as pretty JSON with atomic-replace semantics: write a temp
/// file next to `path`, fsync it, rename it over `path`, fsync the directory.
/// A crash at any point leaves either the old file or the new one, never a
/// truncated mix.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    create_private_dir(dir)?;

    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    let temp_path = dir.join(temp_name);

    let mut temp = open_private(&temp_path)?;
    serde_json::to_writer_pretty(&mut temp, value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to serialise {}: {}", path.display(), err),
        )
    })?;
    temp.write_all(b"\n")?;
    temp.sync_all()?;
    drop(temp);

    std::fs::rename(&temp_path, path)?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn open_private(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
