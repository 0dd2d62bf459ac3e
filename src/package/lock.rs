//! Advisory lock files
//!
//! One lock file per package (or per cache) under the configured lock
//! directory. The lock is an exclusive `flock`-style lock taken without
//! blocking; it is released when the guard drops, whichever path the holder
//! leaves by.

use crate::error::{ProofError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Expand `{user}`, `{package}` and `{pid}` in a lock file name template
pub fn render_lock_name(template: &str, user: &str, package: &str) -> String {
    template
        .replace("{user}", user)
        .replace("{package}", package)
        .replace("{pid}", &std::process::id().to_string())
}

/// Held exclusive lock; released on drop
#[derive(Debug)]
pub struct PackageLock {
    file: File,
    path: PathBuf,
}

impl PackageLock {
    /// Lock the file named by `template` inside `lock_dir`
    ///
    /// Fails with `PackageBusy` if another holder has it.
    pub fn try_acquire(lock_dir: &Path, template: &str, user: &str, name: &str) -> Result<Self> {
        let path = lock_dir.join(render_lock_name(template, user, name));
        Self::acquire_at(&path, name)
    }

    /// Lock an explicit path; `label` names the guarded resource in errors
    pub fn acquire_at(path: &Path, label: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProofError::io(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| ProofError::io(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(lock = %path.display(), "lock acquired");
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(ProofError::PackageBusy { name: label.to_string() })
            }
            Err(e) => Err(ProofError::io(path, e)),
        }
    }

    /// Check whether the lock is currently held elsewhere
    pub fn is_held(lock_dir: &Path, template: &str, user: &str, name: &str) -> Result<bool> {
        match Self::try_acquire(lock_dir, template, user, name) {
            Ok(_held) => Ok(false),
            Err(ProofError::PackageBusy { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PackageLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(lock = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}
