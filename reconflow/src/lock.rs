//! Exclusive workspace lock.
//!
//! Two runs against the same workspace would race on the artifacts that
//! record progress. A run holds `.reconflow.lock` in the workspace root for
//! its whole duration; the file is removed when the guard drops.

use crate::errors::LockError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the lock file in the workspace root.
pub const LOCK_FILE_NAME: &str = ".reconflow.lock";

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    acquired_at: String,
}

/// Guard for an acquired workspace lock.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquires the lock for `workspace`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] if another run holds the lock, and
    /// [`LockError::Io`] if the lock file cannot be created.
    pub fn acquire(workspace: &Path) -> Result<Self, LockError> {
        let path = workspace.join(LOCK_FILE_NAME);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let payload = LockPayload {
                    pid: std::process::id(),
                    acquired_at: Utc::now().to_rfc3339(),
                };
                let body = serde_json::to_string(&payload).unwrap_or_default();
                if let Err(e) = file.write_all(body.as_bytes()).and_then(|()| file.sync_all()) {
                    warn!(path = %path.display(), error = %e, "Could not write lock holder details");
                }
                debug!(path = %path.display(), "Workspace lock acquired");
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                Err(LockError::Held {
                    path,
                    holder: holder.trim().to_string(),
                })
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove workspace lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let tmp = TempDir::new().unwrap();

        let first = WorkspaceLock::acquire(tmp.path()).unwrap();
        assert!(first.path().exists());

        let err = WorkspaceLock::acquire(tmp.path()).unwrap_err();
        match err {
            LockError::Held { holder, .. } => {
                assert!(holder.contains(&std::process::id().to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(first);
        assert!(!tmp.path().join(LOCK_FILE_NAME).exists());

        let second = WorkspaceLock::acquire(tmp.path()).unwrap();
        drop(second);
    }

    #[test]
    fn test_missing_workspace_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = WorkspaceLock::acquire(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, LockError::Io { .. }));
    }
}
