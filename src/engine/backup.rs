//! Single-generation backups taken before a target is modified.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::BackupError;
use super::fsops::FileOps;
use super::verify::{DigestAlgorithm, Digester, digests_match};

const BACKUP_TAG: &str = "backup";
const CANDIDATE_TAG: &str = "downloading";

/// A snapshot of a target taken before a destructive step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Digest of the backup copy, used to tell an intact target from a
    /// damaged one at restore time.
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreResult {
    /// The backup was moved (or copied) back onto the original path.
    Restored,
    /// The original already held the backed-up content; the backup was dropped.
    Intact,
    /// The original was successfully replaced and must not be clobbered.
    KeptUpdate,
}

/// What [`BackupManager::recover_stale`] cleaned up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub restored_from: Option<PathBuf>,
    pub removed: Vec<PathBuf>,
}

/// Sibling name `<name>.<tag>.<suffix>` next to `target`.
pub(crate) fn sibling_path(target: &Path, tag: &str, suffix: &str) -> PathBuf {
    let name = file_name(target);
    target.with_file_name(format!("{}.{}.{}", name, tag, suffix))
}

pub(crate) fn candidate_prefix(target: &Path) -> String {
    format!("{}.{}.", file_name(target), CANDIDATE_TAG)
}

fn file_name(target: &Path) -> String {
    target
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string())
}

fn parent_dir(target: &Path) -> &Path {
    match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[derive(Clone)]
pub struct BackupManager {
    fs: Arc<dyn FileOps>,
    digester: Arc<dyn Digester>,
}

impl BackupManager {
    pub fn new(fs: Arc<dyn FileOps>, digester: Arc<dyn Digester>) -> Self {
        Self { fs, digester }
    }

    /// Copy `target` to `<name>.backup.<timestamp>` in the same directory.
    ///
    /// Returns `Ok(None)` for a first install, where there is nothing to
    /// protect.
    pub fn backup(&self, target: &Path) -> Result<Option<BackupRecord>, BackupError> {
        if !self.fs.exists(target) {
            debug!(path = %target.display(), "nothing to back up");
            return Ok(None);
        }

        let created_at = Utc::now();
        let stamp = created_at.format("%Y%m%d%H%M%S%3f").to_string();
        let mut backup_path = sibling_path(target, BACKUP_TAG, &stamp);
        let mut n = 1;
        while self.fs.exists(&backup_path) {
            backup_path = sibling_path(target, BACKUP_TAG, &format!("{}-{}", stamp, n));
            n += 1;
        }

        if let Err(source) = self.fs.copy(target, &backup_path) {
            // A short copy must not be mistaken for a backup later on.
            self.remove_quietly(&backup_path);
            return Err(BackupError::Copy {
                from: target.to_path_buf(),
                to: backup_path,
                source,
            });
        }

        let digest = match self.digester.digest(&backup_path, DigestAlgorithm::default()) {
            Ok(d) => d,
            Err(source) => {
                self.remove_quietly(&backup_path);
                return Err(BackupError::Digest {
                    path: backup_path,
                    source,
                });
            }
        };

        debug!(backup = %backup_path.display(), "backup created");
        Ok(Some(BackupRecord {
            original_path: target.to_path_buf(),
            backup_path,
            created_at,
            digest,
        }))
    }

    /// Put the backup back, unless the original was successfully replaced.
    ///
    /// An original that is missing, or whose content differs from the
    /// backup, is restored. One that still matches the backup is left as
    /// is and the backup dropped.
    pub fn restore(
        &self,
        record: &BackupRecord,
        target_replaced: bool,
    ) -> Result<RestoreResult, BackupError> {
        let original = &record.original_path;
        if target_replaced {
            return Ok(RestoreResult::KeptUpdate);
        }

        if self.fs.exists(original) {
            let current = self
                .digester
                .digest(original, DigestAlgorithm::default())
                .ok();
            if current.as_deref() == Some(record.digest.as_str()) {
                self.discard(record);
                return Ok(RestoreResult::Intact);
            }
        }

        warn!(
            path = %original.display(),
            backup = %record.backup_path.display(),
            "restoring target from backup"
        );
        self.put_back(&record.backup_path, original)?;
        Ok(RestoreResult::Restored)
    }

    /// Move `backup` onto `original`, consuming the backup.
    fn put_back(&self, backup: &Path, original: &Path) -> Result<(), BackupError> {
        let restore_err = |source: io::Error| BackupError::Restore {
            path: original.to_path_buf(),
            source,
        };
        match self.fs.rename(backup, original) {
            Ok(()) => Ok(()),
            Err(e) if self.fs.exists(original) => {
                // Same lock that defeated the replace; write the bytes back
                // through the existing entry instead.
                debug!(error = %e, "rename refused, restoring in place");
                self.fs
                    .overwrite_in_place(backup, original)
                    .map_err(restore_err)?;
                self.remove_quietly(backup);
                Ok(())
            }
            Err(e) => Err(restore_err(e)),
        }
    }

    /// Delete the backup once the replacement is confirmed.
    pub fn discard(&self, record: &BackupRecord) {
        self.remove_quietly(&record.backup_path);
    }

    fn remove_quietly(&self, path: &Path) {
        match self.fs.remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove file"),
        }
    }

    /// Whether an existing target can be trusted over `backup`: it is either
    /// already the published version or unchanged since the backup.
    fn target_survived(&self, target: &Path, backup: &Path, expected: &str) -> io::Result<bool> {
        if !expected.trim().is_empty() {
            let actual = self
                .digester
                .digest(target, DigestAlgorithm::for_expected(expected))?;
            if digests_match(&actual, expected) {
                return Ok(true);
            }
        }
        let current = self.digester.digest(target, DigestAlgorithm::default())?;
        let saved = self.digester.digest(backup, DigestAlgorithm::default())?;
        Ok(current == saved)
    }

    /// Clean up after a session that died mid-flight.
    ///
    /// The newest backup is moved back when the target is gone, or when the
    /// target matches neither `expected_digest` nor the backup (a replace
    /// that was cut off halfway). If the target cannot be hashed the newest
    /// backup is kept. Older backups and abandoned candidates for this
    /// target are deleted. Only call this while owning the target.
    pub fn recover_stale(
        &self,
        target: &Path,
        expected_digest: &str,
    ) -> Result<SweepReport, BackupError> {
        let dir = parent_dir(target);
        let entries = match self.fs.list_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SweepReport::default()),
            Err(source) => {
                return Err(BackupError::Scan {
                    dir: dir.to_path_buf(),
                    source,
                });
            }
        };

        let name = file_name(target);
        let backup_prefix = format!("{}.{}.", name, BACKUP_TAG);
        let cand_prefix = candidate_prefix(target);

        let mut backups = Vec::new();
        let mut leftovers = Vec::new();
        for p in entries {
            let Some(n) = p.file_name().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if n.starts_with(&backup_prefix) {
                backups.push(p);
            } else if n.starts_with(&cand_prefix) {
                leftovers.push(p);
            }
        }
        backups.sort();

        let mut report = SweepReport::default();
        if let Some(newest) = backups.pop() {
            let survived = if self.fs.exists(target) {
                self.target_survived(target, &newest, expected_digest)
            } else {
                Ok(false)
            };
            match survived {
                Ok(true) => backups.push(newest),
                Ok(false) => {
                    self.put_back(&newest, target)?;
                    info!(
                        path = %target.display(),
                        backup = %newest.display(),
                        "recovered target from a stale backup"
                    );
                    report.restored_from = Some(newest);
                }
                Err(e) => warn!(
                    path = %target.display(),
                    backup = %newest.display(),
                    error = %e,
                    "cannot check target, keeping its backup"
                ),
            }
        }

        for p in backups.into_iter().chain(leftovers) {
            match self.fs.remove_file(&p) {
                Ok(()) => report.removed.push(p),
                Err(e) => warn!(path = %p.display(), error = %e, "cannot remove stale file"),
            }
        }
        Ok(report)
    }
}
