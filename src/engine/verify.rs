//! Content digests and candidate verification.

use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::error::VerifyError;
use super::fsops::FileOps;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// Still published by older update servers.
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    /// Pick the algorithm matching the length of a published hex digest.
    /// Lengths other than SHA-1 and SHA-512 are checked as SHA-256.
    pub fn for_expected(expected: &str) -> Self {
        match expected.trim().len() {
            40 => Self::Sha1,
            128 => Self::Sha512,
            _ => Self::Sha256,
        }
    }

    /// The algorithm a well-formed hex digest was produced with, if any.
    pub fn recognise(expected: &str) -> Option<Self> {
        let e = expected.trim();
        if !e.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        match e.len() {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            128 => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Deterministic content hash of a file, as lowercase hex.
pub trait Digester: Send + Sync {
    fn digest(&self, path: &Path, algorithm: DigestAlgorithm) -> io::Result<String>;

    /// Whether `expected` is something this digester can ever reproduce.
    fn accepts(&self, expected: &str) -> bool {
        DigestAlgorithm::recognise(expected).is_some()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ShaDigester;

impl Digester for ShaDigester {
    fn digest(&self, path: &Path, algorithm: DigestAlgorithm) -> io::Result<String> {
        match algorithm {
            DigestAlgorithm::Sha1 => hash_file::<Sha1>(path),
            DigestAlgorithm::Sha256 => hash_file::<Sha256>(path),
            DigestAlgorithm::Sha512 => hash_file::<Sha512>(path),
        }
    }
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    hash_file::<Sha256>(path)
}

fn hash_file<D: Digest>(path: &Path) -> io::Result<String> {
    let mut f = fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Server-provided digests may differ in casing or carry stray whitespace.
pub fn digests_match(actual: &str, expected: &str) -> bool {
    let expected = expected.trim();
    !expected.is_empty() && actual.trim().eq_ignore_ascii_case(expected)
}

/// Compares files against published digests.
#[derive(Clone)]
pub struct IntegrityVerifier {
    digester: Arc<dyn Digester>,
    fs: Arc<dyn FileOps>,
}

impl IntegrityVerifier {
    pub fn new(digester: Arc<dyn Digester>, fs: Arc<dyn FileOps>) -> Self {
        Self { digester, fs }
    }

    /// Whether a download checked against `expected` could ever verify.
    pub fn accepts(&self, expected: &str) -> bool {
        self.digester.accepts(expected)
    }

    pub fn digest(&self, path: &Path, expected: &str) -> io::Result<String> {
        self.digester
            .digest(path, DigestAlgorithm::for_expected(expected))
    }

    /// Non-destructive check used to decide whether an update is needed.
    ///
    /// A missing file or an empty expected digest never matches.
    pub fn matches(&self, path: &Path, expected: &str) -> io::Result<bool> {
        if expected.trim().is_empty() || !self.fs.exists(path) {
            return Ok(false);
        }
        let actual = self.digest(path, expected)?;
        Ok(digests_match(&actual, expected))
    }

    /// Verify a freshly downloaded candidate.
    ///
    /// On any failure the candidate is deleted before returning, so a
    /// truncated or tampered download can never reach the target.
    pub fn verify(&self, candidate: &Path, expected: &str) -> Result<(), VerifyError> {
        let actual = match self.digest(candidate, expected) {
            Ok(d) => d,
            Err(source) => {
                self.discard(candidate);
                return Err(VerifyError::Io {
                    path: candidate.to_path_buf(),
                    source,
                });
            }
        };
        if !digests_match(&actual, expected) {
            warn!(
                candidate = %candidate.display(),
                expected = expected.trim(),
                actual = %actual,
                "candidate digest mismatch"
            );
            self.discard(candidate);
            return Err(VerifyError::Mismatch {
                expected: expected.trim().to_string(),
                actual,
            });
        }
        debug!(candidate = %candidate.display(), "candidate verified");
        Ok(())
    }

    fn discard(&self, candidate: &Path) {
        if let Err(e) = self.fs.remove_file(candidate)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(candidate = %candidate.display(), error = %e, "cannot delete rejected candidate");
        }
    }
}
