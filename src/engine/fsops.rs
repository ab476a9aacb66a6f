//! Filesystem and sleep capabilities used by the replace and backup stages.
//!
//! Every mutation the engine issues against a target goes through
//! [`FileOps`], so a lock held by another handle (or by the running process
//! itself) can be simulated on any platform by wrapping [`RealFs`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const COPY_BUF: usize = 1024 * 1024;

pub trait FileOps: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Rename `from` onto `to`, replacing `to` if the platform allows it.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;

    /// Truncate `dst` and stream the bytes of `src` into it, keeping the
    /// directory entry (and any handle another process holds on it).
    fn overwrite_in_place(&self, src: &Path, dst: &Path) -> io::Result<u64>;

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl FileOps for RealFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        fs::copy(from, to)
    }

    fn overwrite_in_place(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        // Open the source first so a missing candidate never truncates dst.
        let mut reader = BufReader::with_capacity(COPY_BUF, File::open(src)?);
        let out = OpenOptions::new().write(true).open(dst)?;
        out.set_len(0)?;
        let mut writer = BufWriter::with_capacity(COPY_BUF, out);
        let n = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(n)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for ent in fs::read_dir(dir)? {
            out.push(ent?.path());
        }
        Ok(out)
    }
}

/// Blocking pause between retries.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, d: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Give a freshly downloaded candidate the permission bits of the file it
/// replaces, or make it executable for a first install.
pub fn inherit_permissions(candidate: &Path, target: &Path) -> io::Result<()> {
    match fs::metadata(target) {
        Ok(meta) => fs::set_permissions(candidate, meta.permissions()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => make_executable(candidate),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
pub fn make_executable(p: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perm = fs::metadata(p)?.permissions();
    perm.set_mode(0o755);
    fs::set_permissions(p, perm)
}

#[cfg(not(unix))]
pub fn make_executable(_p: &Path) -> io::Result<()> {
    Ok(())
}

/// Fault injection for the replace and backup stages.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::engine::verify::{DigestAlgorithm, Digester};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Overwrite {
        Allowed,
        Denied,
        /// Write half of the source, then fail. Later overwrites succeed.
        FailMidwayOnce,
    }

    #[derive(Debug, Clone, Copy)]
    pub enum Lock {
        /// Renames onto the path fail; deletes fail `failing_deletes` times
        /// and then release the lock.
        Transient { failing_deletes: u32 },
        /// Renames and deletes always fail.
        Permanent { overwrite: Overwrite },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Destructive {
        pub op: &'static str,
        pub path: PathBuf,
        pub backup_present: bool,
    }

    #[derive(Default)]
    pub struct FaultyFs {
        inner: RealFs,
        locks: Mutex<HashMap<PathBuf, Lock>>,
        destructive: Mutex<Vec<Destructive>>,
        overwrite_calls: Mutex<u32>,
        failing_copies: Mutex<bool>,
        foreign: Mutex<Vec<PathBuf>>,
    }

    impl FaultyFs {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn lock(&self, path: &Path, lock: Lock) {
            self.locks.lock().unwrap().insert(path.to_path_buf(), lock);
        }

        /// Every copy writes half of the source and then fails.
        pub fn fail_copies(&self) {
            *self.failing_copies.lock().unwrap() = true;
        }

        /// Renames out of `path` fail as if it lived on another filesystem.
        pub fn on_other_device(&self, path: &Path) {
            self.foreign.lock().unwrap().push(path.to_path_buf());
        }

        pub fn destructive_ops(&self) -> Vec<Destructive> {
            self.destructive.lock().unwrap().clone()
        }

        pub fn overwrite_calls(&self) -> u32 {
            *self.overwrite_calls.lock().unwrap()
        }

        fn lock_of(&self, path: &Path) -> Option<Lock> {
            self.locks.lock().unwrap().get(path).copied()
        }

        fn record(&self, op: &'static str, path: &Path) {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            if name.contains(".downloading.") || name.contains(".backup.") {
                return;
            }
            let prefix = format!("{}.backup.", name);
            let backup_present = fs::read_dir(path.parent().unwrap())
                .unwrap()
                .flatten()
                .any(|e| e.file_name().to_string_lossy().starts_with(&prefix));
            self.destructive.lock().unwrap().push(Destructive {
                op,
                path: path.to_path_buf(),
                backup_present,
            });
        }
    }

    fn denied() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "file is locked")
    }

    impl FileOps for FaultyFs {
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            if self.lock_of(to).is_some() {
                return Err(denied());
            }
            if self.foreign.lock().unwrap().iter().any(|p| p == from) {
                return Err(io::Error::from(io::ErrorKind::CrossesDevices));
            }
            self.inner.rename(from, to)
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.record("remove", path);
            let mut locks = self.locks.lock().unwrap();
            match locks.get(path).copied() {
                Some(Lock::Permanent { .. }) => Err(denied()),
                Some(Lock::Transient { failing_deletes }) if failing_deletes > 0 => {
                    locks.insert(
                        path.to_path_buf(),
                        Lock::Transient {
                            failing_deletes: failing_deletes - 1,
                        },
                    );
                    Err(denied())
                }
                Some(Lock::Transient { .. }) => {
                    locks.remove(path);
                    drop(locks);
                    self.inner.remove_file(path)
                }
                None => {
                    drop(locks);
                    self.inner.remove_file(path)
                }
            }
        }

        fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
            if *self.failing_copies.lock().unwrap() {
                let bytes = fs::read(from)?;
                fs::write(to, &bytes[..bytes.len() / 2])?;
                return Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
            }
            self.inner.copy(from, to)
        }

        fn overwrite_in_place(&self, src: &Path, dst: &Path) -> io::Result<u64> {
            self.record("overwrite", dst);
            let first = {
                let mut n = self.overwrite_calls.lock().unwrap();
                *n += 1;
                *n == 1
            };
            match self.lock_of(dst) {
                Some(Lock::Permanent {
                    overwrite: Overwrite::Denied,
                }) => Err(denied()),
                Some(Lock::Permanent {
                    overwrite: Overwrite::FailMidwayOnce,
                }) if first => {
                    let bytes = fs::read(src)?;
                    fs::write(dst, &bytes[..bytes.len() / 2])?;
                    Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
                }
                _ => self.inner.overwrite_in_place(src, dst),
            }
        }

        fn list_dir(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.list_dir(dir)
        }
    }

    /// Records requested pauses instead of sleeping.
    #[derive(Default)]
    pub struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub fn slept(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, d: Duration) {
            self.slept.lock().unwrap().push(d);
        }
    }

    /// Treats the trimmed text content of a file as its digest, so fixtures
    /// can be written as `"abc123"` and compared against literal digests.
    #[derive(Default)]
    pub struct ContentDigester;

    impl Digester for ContentDigester {
        fn digest(&self, path: &Path, _algorithm: DigestAlgorithm) -> io::Result<String> {
            Ok(fs::read_to_string(path)?.trim().to_string())
        }

        fn accepts(&self, expected: &str) -> bool {
            !expected.trim().is_empty()
        }
    }
}
