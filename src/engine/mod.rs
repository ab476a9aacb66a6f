//! Safe replacement of on-disk artifacts.
//!
//! A session walks one [`ArtifactDescriptor`] through
//! check → download → verify → backup → replace, and reports a single
//! [`Outcome`]. Each stage lives in its own module and can be used on its
//! own; [`UpdateCoordinator`] wires them together.

mod backup;
mod coordinator;
mod descriptor;
mod error;
mod fetch;
mod fsops;
mod replace;
mod session;
mod verify;

pub use backup::{BackupManager, BackupRecord, RestoreResult, SweepReport};
pub use coordinator::{CoordinatorBuilder, UpdateCoordinator};
pub use descriptor::{ArtifactDescriptor, Outcome, ProgressEvent, ProgressSink};
pub use error::{BackupError, FailureKind, FetchError, ReplaceError, VerifyError};
pub use fetch::{DownloadedCandidate, FetchProgress, Fetcher, HttpFetcher, build_client, human_size};
pub use fsops::{FileOps, RealFs, Sleeper, ThreadSleeper, inherit_permissions, make_executable};
pub use replace::{AtomicReplacer, ReplaceStrategy, RetryPolicy};
pub use session::{CancelToken, SessionGuard, SessionRegistry, UpdateSession, UpdateState};
pub use verify::{
    DigestAlgorithm, Digester, IntegrityVerifier, ShaDigester, digests_match, sha256_file,
};
