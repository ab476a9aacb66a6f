use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a failed update session.
///
/// Every stage error maps onto exactly one kind; callers use it to decide
/// between offering a retry, asking for elevated privileges, or aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Fetch failed or timed out. The target was never touched.
    NetworkError,
    /// Downloaded bytes did not match the expected digest.
    HashMismatch,
    /// The published digest is empty or not a supported hex digest.
    InvalidDigest,
    /// The pre-replace snapshot could not be taken.
    BackupFailed,
    /// The target could not be deleted or overwritten by any strategy.
    LockedOrDenied,
    /// Disk full, permission denied, invalid path.
    FilesystemError,
    /// Another session already owns the target.
    Busy,
    /// The caller cancelled before the destructive phase.
    Cancelled,
}

impl FailureKind {
    /// Whether re-running the whole session can reasonably succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkError
                | Self::HashMismatch
                | Self::LockedOrDenied
                | Self::Busy
                | Self::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkError => "network error",
            Self::HashMismatch => "hash mismatch",
            Self::InvalidDigest => "invalid digest",
            Self::BackupFailed => "backup failed",
            Self::LockedOrDenied => "locked or denied",
            Self::FilesystemError => "filesystem error",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a [`Fetcher`](super::fetch::Fetcher).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("server answered HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("download of {url} ended early: got {received} of {expected} bytes")]
    Truncated {
        url: String,
        received: u64,
        expected: u64,
    },

    #[error("download aborted")]
    Aborted,

    #[error("cannot write candidate file: {0}")]
    Io(#[from] io::Error),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Aborted => FailureKind::Cancelled,
            Self::Io(_) => FailureKind::FilesystemError,
            _ => FailureKind::NetworkError,
        }
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("cannot hash {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl VerifyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Mismatch { .. } => FailureKind::HashMismatch,
            Self::Io { .. } => FailureKind::FilesystemError,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("cannot copy {} to {}: {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot hash backup {}: {source}", .path.display())]
    Digest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot restore {}: {source}", .path.display())]
    Restore {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot scan {}: {source}", .dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ReplaceError {
    #[error(
        "{} is locked or access was denied ({source}); close the running application or retry with elevated privileges",
        .path.display()
    )]
    LockedOrDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to modify {} without a backup", .path.display())]
    BackupMissing { path: PathBuf },

    #[error("cannot install {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReplaceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::LockedOrDenied { .. } => FailureKind::LockedOrDenied,
            Self::BackupMissing { .. } => FailureKind::BackupFailed,
            Self::Filesystem { .. } => FailureKind::FilesystemError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(FailureKind::NetworkError.is_retryable());
        assert!(FailureKind::HashMismatch.is_retryable());
        assert!(FailureKind::LockedOrDenied.is_retryable());
        assert!(!FailureKind::BackupFailed.is_retryable());
        assert!(!FailureKind::FilesystemError.is_retryable());
        assert!(!FailureKind::InvalidDigest.is_retryable());
    }

    #[test]
    fn locked_message_carries_remediation() {
        let e = ReplaceError::LockedOrDenied {
            path: PathBuf::from("/opt/rdi/ui.jar"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        let msg = e.to_string();
        assert!(msg.contains("/opt/rdi/ui.jar"));
        assert!(msg.contains("elevated privileges"));
        assert_eq!(e.kind(), FailureKind::LockedOrDenied);
    }

    #[test]
    fn fetch_error_kinds() {
        assert_eq!(FetchError::Aborted.kind(), FailureKind::Cancelled);
        assert_eq!(
            FetchError::Timeout { url: "u".into() }.kind(),
            FailureKind::NetworkError
        );
        assert_eq!(
            FetchError::Io(io::Error::from(io::ErrorKind::StorageFull)).kind(),
            FailureKind::FilesystemError
        );
    }
}
