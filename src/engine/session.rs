//! Session state and per-target mutual exclusion.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::descriptor::{ArtifactDescriptor, Outcome};

/// Lifecycle of one update session.
///
/// ```text
/// Idle → Checking → Downloading → Verifying → BackingUp → Replacing → Done
///           ↑  └──────────┴─────────────┴──────────┴───────────┴──→ Failed
///           └──────────────────── retry ──────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateState {
    Idle,
    Checking,
    Downloading,
    Verifying,
    BackingUp,
    Replacing,
    Done,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Cancellation is honoured up to the end of verification only.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Checking | Self::Downloading | Self::Verifying
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use UpdateState::*;
        match (self, next) {
            (Idle | Failed, Checking) => true,
            (Checking, Downloading | Done) => true,
            (Downloading, Verifying) => true,
            (Verifying, BackingUp) => true,
            (BackingUp, Replacing) => true,
            (Replacing, Done) => true,
            (Checking | Downloading | Verifying | BackingUp | Replacing, Failed) => true,
            _ => false,
        }
    }
}

/// One artifact's trip through the state machine.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    descriptor: ArtifactDescriptor,
    state: UpdateState,
    attempt_count: u32,
    outcome: Option<Outcome>,
}

impl UpdateSession {
    pub fn new(descriptor: ArtifactDescriptor) -> Self {
        Self {
            descriptor,
            state: UpdateState::Idle,
            attempt_count: 0,
            outcome: None,
        }
    }

    pub fn descriptor(&self) -> &ArtifactDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Outcome of the latest attempt, once it reached a terminal state.
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Whether another attempt may start: a fresh session or the `Retry`
    /// transition out of `Failed`.
    pub fn can_attempt(&self) -> bool {
        self.state.can_transition_to(UpdateState::Checking)
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.attempt_count += 1;
        self.outcome = None;
        self.transition(UpdateState::Checking);
    }

    pub(crate) fn transition(&mut self, next: UpdateState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            artifact = %self.descriptor.name,
            from = ?self.state,
            to = ?next,
            attempt = self.attempt_count,
            "session state"
        );
        self.state = next;
    }

    pub(crate) fn finish(&mut self, outcome: Outcome) -> Outcome {
        let next = if outcome.is_success() {
            UpdateState::Done
        } else {
            UpdateState::Failed
        };
        self.transition(next);
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Cooperative cancellation flag shared between a caller and a session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Paths that currently have a live session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    live: Mutex<HashSet<PathBuf>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for the lifetime of the returned guard, or `None` when
    /// another session holds it.
    pub fn claim(&self, target: &Path) -> Option<SessionGuard<'_>> {
        let key = registry_key(target);
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if !live.insert(key.clone()) {
            return None;
        }
        Some(SessionGuard {
            registry: self,
            key,
        })
    }

    pub fn is_live(&self, target: &Path) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&registry_key(target))
    }
}

#[derive(Debug)]
pub struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    key: PathBuf,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}

/// Two spellings of the same file must map to one key even when the file
/// does not exist yet, so only the parent directory is canonicalised.
fn registry_key(target: &Path) -> PathBuf {
    let abs = std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf());
    match (abs.parent(), abs.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or(abs.clone()),
        _ => abs,
    }
}
