//! The on-disk credential cache store.
//!
//! One YAML document per machine/user maps profile names to cached
//! credentials. The file is created lazily on first write and never
//! deleted here; entries are superseded in place when refreshed.
//! Writing one profile's entry must never lose another profile's, so
//! every write is a read-modify-write of the whole mapping under an
//! exclusive lock.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::lock::{LockError, LockFactory, LOCK_RETRY_DELAY, LOCK_TIMEOUT};
use super::CredentialValue;

/// Names an explicit cache file path, overriding the default location
/// under the user's home directory.
pub const CACHE_FILENAME_ENV: &str = "CLOUDLIFT_CREDENTIAL_CACHE_FILENAME";

/// Enables credential caching at pull-based call sites. Enablement is
/// a caller-side decision; the adapters themselves are unconditional.
pub const ENABLE_CACHE_ENV: &str = "CLOUDLIFT_ENABLE_CREDENTIAL_CACHE";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to create cache directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    /// The file holds secret credentials; group- or other-access bits
    /// mean it cannot be trusted. Never auto-corrected.
    #[error("cache file {0} is not private")]
    NotPrivate(PathBuf),

    #[error("unable to parse cache file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("unable to serialize credential cache: {0}")]
    Serialize(#[source] serde_yaml::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to read cache file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write cache file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("could not determine home directory for the credential cache")]
    NoHomeDir,
}

/// One persisted entry: a credential and the instant it stops being
/// servable. `expiration` is the Unix epoch for credentials that do
/// not expire; the adapters never write such entries, the zero value
/// exists for format symmetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CachedCredential {
    pub credential: CredentialValue,
    pub expiration: DateTime<Utc>,
}

impl CachedCredential {
    /// Servable while the expiration is strictly in the future.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expiration > now
    }
}

/// The whole cache document: profile name to cached credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CacheFile {
    #[serde(default)]
    profiles: HashMap<String, CachedCredential>,
}

impl CacheFile {
    pub fn get(&self, profile: &str) -> Option<&CachedCredential> {
        self.profiles.get(profile)
    }

    /// Insert or overwrite `profile`'s entry, leaving every other
    /// profile untouched.
    pub fn put(&mut self, profile: impl Into<String>, credential: CachedCredential) {
        self.profiles.insert(profile.into(), credential);
    }
}

/// Prepare `path` for use as the credential cache.
///
/// Creates the parent directory (owner-only) if missing. A cache file
/// that does not exist yet is a normal state; an existing one must be
/// private to the owner and parseable. A file failing either check is
/// refused with an error rather than silently tightened or discarded.
pub(crate) fn initialize_cache(path: &Path) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        create_dir_private(parent)?;
    }

    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "credential cache file does not exist yet");
            return Ok(());
        }
        Err(source) => {
            return Err(CacheError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    check_private(path, &metadata)?;
    parse_cache_file(path).map(|_| ())
}

/// Read the cache under a shared lock. A file that has never been
/// written reads as an empty mapping, not an error.
pub(crate) fn read_cache_file(
    path: &Path,
    lock_factory: &LockFactory,
) -> Result<CacheFile, CacheError> {
    match fs::metadata(path) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "credential cache file does not exist yet");
            return Ok(CacheFile::default());
        }
        Err(source) => {
            return Err(CacheError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let mut lock = lock_factory(path);
    lock.lock_shared(LOCK_TIMEOUT, LOCK_RETRY_DELAY)?;
    // lock handle releases on drop, whether the parse succeeds or not
    parse_cache_file(path)
}

/// Replace the cache file under an exclusive lock, atomically and
/// owner-only. Callers pass a mapping freshly read from disk so
/// concurrent writers merge on the profile key instead of clobbering
/// each other's entries.
pub(crate) fn write_cache_file(
    path: &Path,
    lock_factory: &LockFactory,
    cache: &CacheFile,
) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        create_dir_private(parent)?;
    }

    let mut lock = lock_factory(path);
    lock.lock_exclusive(LOCK_TIMEOUT, LOCK_RETRY_DELAY)?;

    let data = serde_yaml::to_string(cache).map_err(CacheError::Serialize)?;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|source| CacheError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    set_private(tmp.as_file()).map_err(|source| CacheError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(data.as_bytes())
        .map_err(|source| CacheError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    tmp.persist(path).map_err(|err| CacheError::Write {
        path: path.to_path_buf(),
        source: err.error,
    })?;
    Ok(())
}

fn parse_cache_file(path: &Path) -> Result<CacheFile, CacheError> {
    let data = fs::read_to_string(path).map_err(|source| CacheError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    // a freshly created or truncated file is an empty mapping
    if data.trim().is_empty() {
        return Ok(CacheFile::default());
    }
    serde_yaml::from_str(&data).map_err(|source| CacheError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Where the credential cache lives: the environment override if set,
/// otherwise a fixed location under the user's home directory.
pub fn cache_file_path() -> Result<PathBuf, CacheError> {
    if let Some(filename) = env_non_empty(CACHE_FILENAME_ENV) {
        return Ok(PathBuf::from(filename));
    }
    let home = dirs::home_dir().ok_or(CacheError::NoHomeDir)?;
    Ok(home
        .join(".cloudlift")
        .join("cache")
        .join("credentials.yaml"))
}

/// Whether pull-based call sites should wrap their provider in the
/// file cache.
pub fn credential_cache_enabled() -> bool {
    env_non_empty(ENABLE_CACHE_ENV).is_some()
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(unix)]
fn create_dir_private(dir: &Path) -> Result<(), CacheError> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|source| CacheError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
}

#[cfg(not(unix))]
fn create_dir_private(dir: &Path) -> Result<(), CacheError> {
    fs::create_dir_all(dir).map_err(|source| CacheError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(unix)]
fn check_private(path: &Path, metadata: &fs::Metadata) -> Result<(), CacheError> {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(CacheError::NotPrivate(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_private(_path: &Path, _metadata: &fs::Metadata) -> Result<(), CacheError> {
    Ok(())
}

#[cfg(unix)]
fn set_private(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_private(_file: &fs::File) -> io::Result<()> {
    Ok(())
}
