//! Crash-safe document writes.
//!
//! A document is written to a temp file in the target directory and renamed
//! over the old one, so readers see either the previous document or the new
//! one. Where rename-over-existing is refused (Windows), the old document is
//! first moved to `<name>.bak` and restored if the second rename fails;
//! [`restore_interrupted`] finishes that dance after a crash.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// How hard a write tries to survive power loss, and who may read the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Durability {
    /// `fsync` the document before it replaces the old one.
    pub sync_file: bool,
    /// `fsync` the directory after the rename (best effort, unix only).
    pub sync_dir: bool,
    /// Restrict the document to its owner (0o600 on unix).
    pub owner_only: bool,
}

impl Durability {
    /// Session documents: synced, private.
    pub const DURABLE: Self = Self {
        sync_file: true,
        sync_dir: true,
        owner_only: true,
    };

    /// No syncing. For tests and scratch data.
    pub const FAST: Self = Self {
        sync_file: false,
        sync_dir: false,
        owner_only: false,
    };
}

impl Default for Durability {
    fn default() -> Self {
        Self::DURABLE
    }
}

/// What [`restore_interrupted`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No interrupted write.
    Clean,
    /// The backup was moved back into place.
    Restored,
    /// A backup exists but could not be restored.
    Failed,
}

fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("bak")
}

/// Puts back a document whose replacement was interrupted between moving it
/// to `.bak` and renaming the new one into place.
pub fn restore_interrupted(path: &Path) -> Recovery {
    let backup = backup_path(path);
    if path.exists() || !backup.exists() {
        return Recovery::Clean;
    }
    match fs::rename(&backup, path) {
        Ok(()) => {
            tracing::warn!(path = %path.display(), "Restored document from interrupted write");
            Recovery::Restored
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "Failed to restore document backup");
            Recovery::Failed
        }
    }
}

/// Atomically replaces the document at `path` with `bytes`, creating parent
/// directories as needed.
pub fn write_document(path: &Path, bytes: &[u8], durability: Durability) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut staged = NamedTempFile::new_in(dir)?;
    restrict(staged.path(), durability)?;
    staged.write_all(bytes)?;
    if durability.sync_file {
        staged.as_file().sync_all()?;
    }

    if let Err(refused) = staged.persist(path) {
        if !path.exists() {
            return Err(refused.error);
        }
        replace_via_backup(path, refused.file)?;
    }

    restrict(path, durability)?;
    if durability.sync_dir {
        sync_dir(dir);
    }
    Ok(())
}

fn replace_via_backup(path: &Path, staged: NamedTempFile) -> io::Result<()> {
    let backup = backup_path(path);
    let _ = fs::remove_file(&backup);
    fs::rename(path, &backup)?;

    if let Err(err) = staged.persist(path) {
        let _ = fs::rename(&backup, path);
        return Err(err.error);
    }
    if let Err(err) = fs::remove_file(&backup) {
        tracing::warn!(path = %backup.display(), error = %err, "Failed to remove document backup");
    }
    Ok(())
}

#[cfg(unix)]
fn restrict(path: &Path, durability: Durability) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if durability.owner_only {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _durability: Durability) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(path = %dir.display(), error = %err, "Directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
