//! Replace a target file with a verified candidate.
//!
//! Strategies are attempted in order and fall through on failure:
//!
//! 1. **Atomic move**: rename the candidate onto the target.
//! 2. **Delete then move**: delete the target with bounded retries (a lock
//!    held by another handle is often released within a second), then move.
//! 3. **In-place overwrite**: truncate the target and copy the candidate's
//!    bytes into it. This is not atomic. It is only used when the target
//!    can be neither renamed over nor deleted, e.g. on Windows while the
//!    running process holds the artifact open.
//!
//! Strategies 2 and 3 require a backup of the target.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::backup::BackupRecord;
use super::error::ReplaceError;
use super::fsops::{FileOps, Sleeper};

/// Bounded delete retries for strategy 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplaceStrategy {
    AtomicMove,
    DeleteThenMove,
    InPlaceOverwrite,
}

impl ReplaceStrategy {
    /// `false` only for the degraded in-place overwrite.
    pub fn is_atomic(self) -> bool {
        !matches!(self, Self::InPlaceOverwrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AtomicMove => "atomic move",
            Self::DeleteThenMove => "delete then move",
            Self::InPlaceOverwrite => "in-place overwrite (degraded)",
        }
    }
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct AtomicReplacer {
    fs: Arc<dyn FileOps>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl AtomicReplacer {
    pub fn new(fs: Arc<dyn FileOps>, sleeper: Arc<dyn Sleeper>, policy: RetryPolicy) -> Self {
        Self {
            fs,
            sleeper,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Replace `target` with `candidate`.
    ///
    /// `backup` must describe a copy of the current target whenever the
    /// target exists; without it only the atomic move is attempted. On
    /// success the candidate no longer exists.
    pub fn replace(
        &self,
        target: &Path,
        candidate: &Path,
        backup: Option<&BackupRecord>,
    ) -> Result<ReplaceStrategy, ReplaceError> {
        let first = match self.move_into_place(candidate, target) {
            Ok(()) => {
                info!(path = %target.display(), "replaced by atomic move");
                return Ok(ReplaceStrategy::AtomicMove);
            }
            Err(e) => e,
        };
        debug!(path = %target.display(), error = %first, "atomic move refused");

        if self.fs.exists(target) {
            let protected = backup
                .map(|b| b.original_path == target && self.fs.exists(&b.backup_path))
                .unwrap_or(false);
            if !protected {
                return Err(ReplaceError::BackupMissing {
                    path: target.to_path_buf(),
                });
            }
        }

        let delete_err = match self.delete_with_retry(target) {
            Ok(()) => {
                return match self.move_into_place(candidate, target) {
                    Ok(()) => {
                        info!(path = %target.display(), "replaced by delete then move");
                        Ok(ReplaceStrategy::DeleteThenMove)
                    }
                    Err(source) => Err(ReplaceError::Filesystem {
                        path: target.to_path_buf(),
                        source,
                    }),
                };
            }
            Err(e) => e,
        };

        warn!(
            path = %target.display(),
            error = %delete_err,
            "target still locked after {} delete attempts; falling back to non-atomic in-place overwrite",
            self.policy.attempts
        );
        match self.fs.overwrite_in_place(candidate, target) {
            Ok(bytes) => {
                warn!(
                    path = %target.display(),
                    bytes,
                    "replaced by in-place overwrite (degraded)"
                );
                if let Err(e) = self.fs.remove_file(candidate) {
                    debug!(error = %e, "candidate left behind after overwrite");
                }
                Ok(ReplaceStrategy::InPlaceOverwrite)
            }
            Err(source) => Err(ReplaceError::LockedOrDenied {
                path: target.to_path_buf(),
                source,
            }),
        }
    }

    /// Rename, or when the candidate sits on another filesystem, copy it to
    /// a staging sibling of the target and rename that.
    fn move_into_place(&self, candidate: &Path, target: &Path) -> io::Result<()> {
        match self.fs.rename(candidate, target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                let staging = staging_path(candidate, target);
                let staged = self
                    .fs
                    .copy(candidate, &staging)
                    .and_then(|_| self.fs.rename(&staging, target));
                if let Err(e) = staged {
                    if let Err(rm) = self.fs.remove_file(&staging)
                        && rm.kind() != io::ErrorKind::NotFound
                    {
                        debug!(path = %staging.display(), error = %rm, "staging file left behind");
                    }
                    return Err(e);
                }
                if let Err(e) = self.fs.remove_file(candidate) {
                    debug!(path = %candidate.display(), error = %e, "candidate left behind after staging");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn delete_with_retry(&self, target: &Path) -> io::Result<()> {
        let mut last = None;
        for attempt in 1..=self.policy.attempts {
            if !self.fs.exists(target) {
                return Ok(());
            }
            match self.fs.remove_file(target) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    debug!(path = %target.display(), attempt, error = %e, "delete failed");
                    last = Some(e);
                }
            }
            if attempt < self.policy.attempts {
                self.sleeper.sleep(self.policy.delay);
            }
        }
        if !self.fs.exists(target) {
            return Ok(());
        }
        Err(last.unwrap_or_else(|| io::Error::other("no delete attempts configured")))
    }
}

fn staging_path(candidate: &Path, target: &Path) -> PathBuf {
    let name = candidate
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "candidate".to_string());
    target.with_file_name(format!("{}.staging", name))
}
