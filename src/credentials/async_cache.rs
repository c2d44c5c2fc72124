//! File-cache adapter for cancellable credential providers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::clock::Clock;

use super::cache::{
    initialize_cache, read_cache_file, write_cache_file, CacheError, CachedCredential,
};
use super::lock::LockFactory;
use super::provider::AsyncCredentialsProvider;
use super::Credentials;

/// Wraps a cancellable provider, expected to be consulted once per
/// outgoing API call. Re-parsing the cache file at that rate would be
/// wasteful, so a memoized value sits in front of the on-disk store;
/// the file stays the source of truth across processes and the memo is
/// a cache-of-the-cache with the same expiry rule applied twice.
pub struct AsyncFileCache {
    provider: Arc<dyn AsyncCredentialsProvider>,
    profile: String,
    clock: Arc<dyn Clock>,
    cache_file_path: PathBuf,
    lock_factory: LockFactory,
    memo: Mutex<Memo>,
}

#[derive(Default)]
struct Memo {
    loaded: bool,
    credentials: Option<Credentials>,
}

impl std::fmt::Debug for AsyncFileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFileCache")
            .field("profile", &self.profile)
            .field("cache_file_path", &self.cache_file_path)
            .finish_non_exhaustive()
    }
}

impl AsyncFileCache {
    /// Wrap `provider` in the on-disk cache for `profile`. Fails when
    /// the existing cache file cannot be trusted or parsed.
    pub fn new(
        profile: impl Into<String>,
        provider: Arc<dyn AsyncCredentialsProvider>,
        clock: Arc<dyn Clock>,
        lock_factory: LockFactory,
        cache_file_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let cache_file_path = cache_file_path.into();
        initialize_cache(&cache_file_path).context("error initializing credentials cache")?;

        Ok(Self {
            provider,
            profile: profile.into(),
            clock,
            cache_file_path,
            lock_factory,
            memo: Mutex::new(Memo::default()),
        })
    }

    fn persist(&self, entry: CachedCredential) -> Result<(), CacheError> {
        // re-read to merge writes other processes landed since we last
        // looked at the file
        let mut cache = read_cache_file(&self.cache_file_path, &self.lock_factory)?;
        cache.put(self.profile.clone(), entry);
        write_cache_file(&self.cache_file_path, &self.lock_factory, &cache)
    }
}

#[async_trait]
impl AsyncCredentialsProvider for AsyncFileCache {
    /// Resolve credentials, serving the memoized value while it is
    /// live. Calls within one process are fully serialized by the memo
    /// lock. Dropping the returned future cancels an in-flight
    /// upstream call; disk persistence of a fresh result is
    /// best-effort and never a precondition for returning it.
    async fn retrieve(&self) -> Result<Credentials> {
        let mut memo = self.memo.lock().await;

        if !memo.loaded {
            memo.loaded = true;
            match read_cache_file(&self.cache_file_path, &self.lock_factory) {
                Ok(cache) => {
                    memo.credentials = cache.get(&self.profile).map(|entry| Credentials {
                        value: entry.credential.clone(),
                        expires_at: Some(entry.expiration),
                    });
                }
                Err(err) => warn!(error = %err, "unable to read credential cache"),
            }
        }

        let now = self.clock.now();
        if let Some(credentials) = &memo.credentials {
            if let Some(expires_at) = credentials.expires_at {
                if expires_at > now {
                    return Ok(credentials.clone());
                }
            }
        }

        let fresh = self.provider.retrieve().await?;
        memo.credentials = Some(fresh.clone());

        let Some(expiration) = fresh.expires_at else {
            // cannot expire, must never be persisted
            return Ok(fresh);
        };

        let entry = CachedCredential {
            credential: fresh.value.clone(),
            expiration,
        };
        if let Err(err) = self.persist(entry) {
            warn!(
                error = %err,
                path = %self.cache_file_path.display(),
                "unable to update credential cache"
            );
        }
        Ok(fresh)
    }
}
