//! End-to-end update sessions.

use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::backup::{BackupManager, BackupRecord, RestoreResult};
use super::descriptor::{ArtifactDescriptor, Outcome, ProgressEvent, ProgressSink};
use super::error::{FailureKind, ReplaceError, VerifyError};
use super::fetch::{DownloadedCandidate, FetchProgress, Fetcher};
use super::fsops::{self, FileOps, RealFs, Sleeper, ThreadSleeper};
use super::replace::{AtomicReplacer, ReplaceStrategy, RetryPolicy};
use super::session::{CancelToken, SessionRegistry, UpdateSession, UpdateState};
use super::verify::{Digester, IntegrityVerifier, ShaDigester};

pub struct CoordinatorBuilder {
    fetcher: Arc<dyn Fetcher>,
    fs: Arc<dyn FileOps>,
    digester: Arc<dyn Digester>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl CoordinatorBuilder {
    pub fn file_ops(mut self, fs: Arc<dyn FileOps>) -> Self {
        self.fs = fs;
        self
    }

    pub fn digester(mut self, digester: Arc<dyn Digester>) -> Self {
        self.digester = digester;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> UpdateCoordinator {
        UpdateCoordinator {
            verifier: IntegrityVerifier::new(self.digester.clone(), self.fs.clone()),
            backups: BackupManager::new(self.fs.clone(), self.digester),
            replacer: AtomicReplacer::new(self.fs, self.sleeper, self.policy),
            fetcher: self.fetcher,
            registry: SessionRegistry::new(),
        }
    }
}

/// Runs update sessions: check, fetch, verify, back up, replace.
///
/// One coordinator can be shared between threads; sessions for disjoint
/// targets run concurrently while a second session for a live target is
/// turned away with [`FailureKind::Busy`].
pub struct UpdateCoordinator {
    fetcher: Arc<dyn Fetcher>,
    verifier: IntegrityVerifier,
    backups: BackupManager,
    replacer: AtomicReplacer,
    registry: SessionRegistry,
}

fn phase(sink: &dyn ProgressSink, text: impl Into<String>) {
    sink.on_progress(&ProgressEvent::Phase(text.into()));
}

impl UpdateCoordinator {
    /// Coordinator over the host filesystem and SHA-2 digests.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::builder(fetcher).build()
    }

    pub fn builder(fetcher: Arc<dyn Fetcher>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            fetcher,
            fs: Arc::new(RealFs),
            digester: Arc::new(ShaDigester),
            sleeper: Arc::new(ThreadSleeper),
            policy: RetryPolicy::default(),
        }
    }

    /// The check step alone: does the local target differ from what is
    /// published? Never touches the network.
    pub fn needs_update(&self, descriptor: &ArtifactDescriptor) -> io::Result<bool> {
        self.verifier
            .matches(descriptor.target(), &descriptor.expected_digest)
            .map(|current| !current)
    }

    pub fn check_and_update(
        &self,
        descriptor: &ArtifactDescriptor,
        sink: &dyn ProgressSink,
    ) -> Outcome {
        self.check_and_update_with_cancel(descriptor, sink, &CancelToken::new())
    }

    pub fn check_and_update_with_cancel(
        &self,
        descriptor: &ArtifactDescriptor,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Outcome {
        let mut session = UpdateSession::new(descriptor.clone());
        self.attempt(&mut session, sink, cancel)
    }

    /// Re-run a session that ended `Failed`. Any other session is left as
    /// is and its recorded outcome (if any) returned.
    pub fn retry(&self, session: &mut UpdateSession, sink: &dyn ProgressSink) -> Outcome {
        match session.state() {
            UpdateState::Failed => self.attempt(session, sink, &CancelToken::new()),
            _ => session.outcome().cloned().unwrap_or_else(|| {
                Outcome::failed(FailureKind::Busy, "session has not failed; nothing to retry")
            }),
        }
    }

    /// Run one attempt of `session`: its first, or a manual retry after
    /// `Failed`. The engine never loops on its own; the caller decides
    /// whether and how often to call this again.
    ///
    /// A session that already reached `Done` is not re-run; its recorded
    /// outcome is returned.
    pub fn attempt(
        &self,
        session: &mut UpdateSession,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Outcome {
        if !session.can_attempt() {
            return session
                .outcome()
                .cloned()
                .unwrap_or(Outcome::AlreadyCurrent);
        }
        session.begin_attempt();
        let outcome = self.run(session, sink, cancel);
        match &outcome {
            Outcome::Failed { kind, message } => {
                error!(artifact = %session.descriptor().name, %kind, reason = %message, "update failed")
            }
            other => info!(artifact = %session.descriptor().name, outcome = %other, "update finished"),
        }
        session.finish(outcome)
    }

    fn run(
        &self,
        session: &mut UpdateSession,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Outcome {
        let d = session.descriptor().clone();
        let target = d.target();

        let Some(_guard) = self.registry.claim(target) else {
            return Outcome::failed(
                FailureKind::Busy,
                format!("another update of {} is in progress", target.display()),
            );
        };

        // Checking
        phase(sink, format!("checking {}", d.name));
        match self.backups.recover_stale(target, &d.expected_digest) {
            Ok(report) if report.restored_from.is_some() => {
                phase(sink, format!("recovered {} from an interrupted update", d.name))
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale file cleanup failed"),
        }
        match self.verifier.matches(target, &d.expected_digest) {
            Ok(true) => {
                phase(sink, format!("{} is already up to date", d.name));
                return Outcome::AlreadyCurrent;
            }
            Ok(false) => {}
            Err(e) => {
                return Outcome::failed(
                    FailureKind::FilesystemError,
                    format!("cannot read {}: {}", target.display(), e),
                );
            }
        }
        if d.expected_digest.trim().is_empty() {
            return Outcome::failed(
                FailureKind::InvalidDigest,
                format!("no digest published for {}; refusing unverified download", d.name),
            );
        }
        if !self.verifier.accepts(&d.expected_digest) {
            return Outcome::failed(
                FailureKind::InvalidDigest,
                format!(
                    "unsupported digest {:?} for {}; expected SHA-1, SHA-256 or SHA-512 hex",
                    d.expected_digest.trim(),
                    d.name
                ),
            );
        }
        if cancel.is_cancelled() {
            return cancelled();
        }

        // Downloading
        session.transition(UpdateState::Downloading);
        phase(sink, format!("preparing to download {}...", d.name));
        let candidate = match DownloadedCandidate::beside(target) {
            Ok(c) => c,
            Err(e) => {
                return Outcome::failed(
                    FailureKind::FilesystemError,
                    format!("cannot create download file next to {}: {}", target.display(), e),
                );
            }
        };
        let mut on_progress = |p: &FetchProgress| {
            sink.on_progress(&ProgressEvent::Transfer(*p));
            if cancel.is_cancelled() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        if let Err(e) = self
            .fetcher
            .fetch(&d.download_url, candidate.path(), &mut on_progress)
        {
            let kind = e.kind();
            if kind == FailureKind::NetworkError {
                phase(sink, format!("download failed, check the network and retry: {}", e));
            }
            return Outcome::failed(kind, e.to_string());
        }
        if cancel.is_cancelled() {
            return cancelled();
        }

        // Verifying
        session.transition(UpdateState::Verifying);
        phase(sink, format!("verifying {}", d.name));
        if let Err(e) = self.verifier.verify(candidate.path(), &d.expected_digest) {
            if matches!(e, VerifyError::Mismatch { .. }) {
                phase(sink, "downloaded file is corrupt, please retry");
            }
            return Outcome::failed(e.kind(), e.to_string());
        }
        if let Err(e) = fsops::inherit_permissions(candidate.path(), target) {
            debug!(error = %e, "cannot carry permissions over to candidate");
        }
        if cancel.is_cancelled() {
            return cancelled();
        }

        // From here on the session runs to a terminal outcome.
        session.transition(UpdateState::BackingUp);
        let record = match self.backups.backup(target) {
            Ok(r) => r,
            Err(e) => return Outcome::failed(FailureKind::BackupFailed, e.to_string()),
        };

        session.transition(UpdateState::Replacing);
        phase(sink, format!("installing {}", d.name));
        match self
            .replacer
            .replace(target, candidate.path(), record.as_ref())
        {
            Ok(strategy) => self.confirm(&d, strategy, record.as_ref(), sink),
            Err(e) => {
                phase(sink, format!("could not replace {}: {}", d.name, e));
                self.roll_back(record.as_ref());
                Outcome::failed(e.kind(), e.to_string())
            }
        }
    }

    /// Post-replace bookkeeping. The degraded path is re-verified since a
    /// short copy would otherwise go unnoticed.
    fn confirm(
        &self,
        d: &ArtifactDescriptor,
        strategy: ReplaceStrategy,
        record: Option<&BackupRecord>,
        sink: &dyn ProgressSink,
    ) -> Outcome {
        if !strategy.is_atomic() {
            phase(sink, format!("{} replaced in place (degraded)", d.name));
            match self.verifier.matches(d.target(), &d.expected_digest) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    self.roll_back(record);
                    let e = ReplaceError::LockedOrDenied {
                        path: d.target_path.clone(),
                        source: io::Error::other("in-place overwrite left unexpected content"),
                    };
                    return Outcome::failed(e.kind(), e.to_string());
                }
            }
        }
        if let Some(r) = record {
            self.backups.discard(r);
        }
        phase(sink, format!("{} updated to the latest version", d.name));
        Outcome::Updated { strategy }
    }

    fn roll_back(&self, record: Option<&BackupRecord>) {
        let Some(r) = record else {
            return;
        };
        match self.backups.restore(r, false) {
            Ok(RestoreResult::Restored) => {
                warn!(path = %r.original_path.display(), "target restored from backup")
            }
            Ok(_) => debug!(path = %r.original_path.display(), "target intact, backup dropped"),
            Err(e) => error!(
                path = %r.original_path.display(),
                backup = %r.backup_path.display(),
                error = %e,
                "restore failed; backup kept"
            ),
        }
    }
}

fn cancelled() -> Outcome {
    Outcome::failed(FailureKind::Cancelled, "update cancelled before installation")
}
