//! Advisory locking for the shared credential cache file.
//!
//! The cache file is mutated by unrelated processes, so every read
//! takes a shared lock and every write an exclusive one. Acquisition
//! is bounded by a short timeout: the cache is a pure optimization,
//! and a lock that cannot be obtained promptly must fail the cache
//! operation rather than stall credential resolution.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::warn;

/// Upper bound on waiting for the cache file lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Interval between lock acquisition attempts.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {0:?} waiting to lock {1}")]
    Timeout(Duration, PathBuf),

    #[error("unable to open lock file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("I/O error while locking {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// A lock handle bound to one filesystem path.
///
/// Implementations release any held lock when dropped, so the lock is
/// released on every exit path of the caller.
pub trait FileLock: Send {
    /// Block, retrying every `retry_delay`, until a shared lock is
    /// obtained or `timeout` elapses. Shared locks may coexist with
    /// each other but not with an exclusive lock.
    fn lock_shared(&mut self, timeout: Duration, retry_delay: Duration) -> Result<(), LockError>;

    /// Like [`lock_shared`](Self::lock_shared), but exclusive:
    /// mutually exclusive with any lock held by any other process on
    /// the same path.
    fn lock_exclusive(&mut self, timeout: Duration, retry_delay: Duration)
        -> Result<(), LockError>;

    /// Release the lock if held.
    fn unlock(&mut self) -> io::Result<()>;
}

/// Produces the lock handle guarding a given cache file path. Injected
/// into the store operations so tests can substitute fakes.
pub type LockFactory = Arc<dyn Fn(&Path) -> Box<dyn FileLock> + Send + Sync>;

/// The factory used outside of tests: one [`Flock`] per path.
pub fn flock_factory() -> LockFactory {
    Arc::new(|path: &Path| Box::new(Flock::new(path)) as Box<dyn FileLock>)
}

/// Advisory lock backed by `flock(2)` through the `fs2` crate.
///
/// Locks a sibling `<path>.lock` file rather than the cache file
/// itself: the cache file is replaced by rename on every write, which
/// would detach a lock held on the replaced inode.
pub struct Flock {
    lock_path: PathBuf,
    file: Option<File>,
}

impl Flock {
    pub fn new(path: &Path) -> Self {
        let mut lock_path = path.as_os_str().to_os_string();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            file: None,
        }
    }

    fn acquire(
        &mut self,
        exclusive: bool,
        timeout: Duration,
        retry_delay: Duration,
    ) -> Result<(), LockError> {
        if self.file.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| LockError::Open {
                path: self.lock_path.clone(),
                source,
            })?;

        let start = Instant::now();
        loop {
            let attempt = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match attempt {
                Ok(()) => {
                    self.file = Some(file);
                    return Ok(());
                }
                Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    if start.elapsed() >= timeout {
                        return Err(LockError::Timeout(timeout, self.lock_path.clone()));
                    }
                    std::thread::sleep(retry_delay);
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: self.lock_path.clone(),
                        source,
                    })
                }
            }
        }
    }
}

impl FileLock for Flock {
    fn lock_shared(&mut self, timeout: Duration, retry_delay: Duration) -> Result<(), LockError> {
        self.acquire(false, timeout, retry_delay)
    }

    fn lock_exclusive(
        &mut self,
        timeout: Duration,
        retry_delay: Duration,
    ) -> Result<(), LockError> {
        self.acquire(true, timeout, retry_delay)
    }

    fn unlock(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => FileExt::unlock(&file),
            None => Ok(()),
        }
    }
}

impl Drop for Flock {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.unlock() {
                warn!(
                    error = %err,
                    path = %self.lock_path.display(),
                    "unable to release credential cache lock"
                );
            }
        }
    }
}
