use std::fmt;
use std::path::{Path, PathBuf};

use super::error::FailureKind;
use super::fetch::FetchProgress;
use super::replace::ReplaceStrategy;

/// One replaceable file and where its current version comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    /// Display label, e.g. `ui` or `mc-1.21.1-neoforge`.
    pub name: String,
    pub target_path: PathBuf,
    pub download_url: String,
    /// Hex digest of the published artifact. Empty when unknown.
    pub expected_digest: String,
}

impl ArtifactDescriptor {
    pub fn new(
        name: impl Into<String>,
        target_path: impl Into<PathBuf>,
        download_url: impl Into<String>,
        expected_digest: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_path: target_path.into(),
            download_url: download_url.into(),
            expected_digest: expected_digest.into(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target_path
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    AlreadyCurrent,
    Updated { strategy: ReplaceStrategy },
    Failed { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed { kind, .. } if kind.is_retryable())
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyCurrent => f.write_str("already up to date"),
            Self::Updated { strategy } if strategy.is_atomic() => f.write_str("updated"),
            Self::Updated { strategy } => write!(f, "updated via {}", strategy),
            Self::Failed { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

/// A progress notification emitted during a session.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Free-text phase description.
    Phase(String),
    Transfer(FetchProgress),
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phase(s) => f.write_str(s),
            Self::Transfer(p) => p.fmt(f),
        }
    }
}

/// Receives progress synchronously on the thread running the session.
///
/// Hosts with a UI thread must forward events there themselves.
pub trait ProgressSink {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent),
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display() {
        assert_eq!(Outcome::AlreadyCurrent.to_string(), "already up to date");
        assert_eq!(
            Outcome::Updated {
                strategy: ReplaceStrategy::AtomicMove
            }
            .to_string(),
            "updated"
        );
        assert_eq!(
            Outcome::Updated {
                strategy: ReplaceStrategy::InPlaceOverwrite
            }
            .to_string(),
            "updated via in-place overwrite (degraded)"
        );
        assert_eq!(
            Outcome::failed(FailureKind::HashMismatch, "bad bytes").to_string(),
            "hash mismatch: bad bytes"
        );
    }

    #[test]
    fn retryable_follows_kind() {
        assert!(Outcome::failed(FailureKind::NetworkError, "").is_retryable());
        assert!(!Outcome::failed(FailureKind::BackupFailed, "").is_retryable());
        assert!(!Outcome::AlreadyCurrent.is_retryable());
    }

    #[test]
    fn closures_are_sinks() {
        use std::cell::RefCell;
        let seen = RefCell::new(Vec::new());
        let sink = |e: &ProgressEvent| seen.borrow_mut().push(e.to_string());
        sink.on_progress(&ProgressEvent::Phase("checking".into()));
        assert_eq!(seen.into_inner(), vec!["checking".to_string()]);
    }
}
