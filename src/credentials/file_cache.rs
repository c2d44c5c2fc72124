//! File-cache adapter for pull-based credential providers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};

use super::cache::{
    cache_file_path, initialize_cache, read_cache_file, write_cache_file, CacheError, CacheFile,
    CachedCredential,
};
use super::lock::{flock_factory, LockFactory};
use super::provider::CredentialsProvider;
use super::CredentialValue;

/// Wraps a pull-based provider, serving credentials from the shared
/// on-disk cache while they are live and refreshing through the
/// wrapped provider when they are not.
///
/// Fresh credentials are persisted only when the wrapped provider
/// reports an expiry; long-lived static keys are passed through and
/// never written to disk. Persistence is best-effort: a failed cache
/// update is logged and the fresh credential returned regardless,
/// because credential availability must never depend on cache
/// availability.
pub struct FileCacheProvider {
    provider: Box<dyn CredentialsProvider>,
    profile: String,
    clock: Arc<dyn Clock>,
    cache_file_path: PathBuf,
    lock_factory: LockFactory,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    /// The on-disk entry is consulted once per adapter, not per call.
    loaded: bool,
    cached: Option<CachedCredential>,
}

impl std::fmt::Debug for FileCacheProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCacheProvider")
            .field("profile", &self.profile)
            .field("cache_file_path", &self.cache_file_path)
            .finish_non_exhaustive()
    }
}

impl FileCacheProvider {
    /// Wrap `provider` in the on-disk cache for `profile`.
    ///
    /// Fails when no provider is supplied (there is nothing to cache
    /// or fall back to) and when the existing cache file cannot be
    /// trusted or parsed, so a broken or tampered cache surfaces at
    /// construction rather than on first use.
    pub fn new(
        profile: impl Into<String>,
        provider: Option<Box<dyn CredentialsProvider>>,
        clock: Arc<dyn Clock>,
        lock_factory: LockFactory,
        cache_file_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let provider =
            provider.ok_or_else(|| anyhow!("no underlying credentials provider supplied"))?;
        let cache_file_path = cache_file_path.into();
        initialize_cache(&cache_file_path).context("error initializing credentials cache")?;

        Ok(Self {
            provider,
            profile: profile.into(),
            clock,
            cache_file_path,
            lock_factory,
            state: Mutex::new(CacheState::default()),
        })
    }

    fn persist(&self, entry: CachedCredential) -> Result<(), CacheError> {
        // merge against whatever other profiles are on disk right now
        let mut cache = match read_cache_file(&self.cache_file_path, &self.lock_factory) {
            Ok(cache) => cache,
            Err(err) => {
                warn!(error = %err, "unable to re-read credential cache before writing");
                CacheFile::default()
            }
        };
        cache.put(self.profile.clone(), entry);
        write_cache_file(&self.cache_file_path, &self.lock_factory, &cache)
    }
}

impl CredentialsProvider for FileCacheProvider {
    /// Return the cached credential while it is live; otherwise pull a
    /// fresh one from the wrapped provider, persisting it when the
    /// provider reports an expiry.
    fn retrieve(&self) -> Result<CredentialValue> {
        let mut state = self.state.lock().expect("credential cache state poisoned");

        if !state.loaded {
            state.loaded = true;
            match read_cache_file(&self.cache_file_path, &self.lock_factory) {
                Ok(cache) => state.cached = cache.get(&self.profile).cloned(),
                Err(err) => warn!(error = %err, "unable to read credential cache"),
            }
        }

        let now = self.clock.now();
        if let Some(cached) = &state.cached {
            if cached.is_live(now) {
                return Ok(cached.credential.clone());
            }
        }

        info!(profile = %self.profile, "no live cached credential, refreshing");
        let credential = self.provider.retrieve()?;

        let Some(expiration) = self.provider.expires_at() else {
            // the provider cannot report an expiry; such credentials
            // must never be persisted
            warn!(
                profile = %self.profile,
                "credential source reports no expiry, not caching"
            );
            return Ok(credential);
        };

        let entry = CachedCredential {
            credential: credential.clone(),
            expiration,
        };
        state.cached = Some(entry.clone());

        match self.persist(entry) {
            Ok(()) => info!(path = %self.cache_file_path.display(), "updated credential cache"),
            Err(err) => warn!(
                error = %err,
                path = %self.cache_file_path.display(),
                "unable to update credential cache"
            ),
        }
        Ok(credential)
    }

    /// Whether the adapter's current notion of the credential is past
    /// its expiry, falling back to the wrapped provider when nothing
    /// has been cached or fetched yet.
    fn is_expired(&self) -> bool {
        let state = self.state.lock().expect("credential cache state poisoned");
        match &state.cached {
            Some(cached) => !cached.is_live(self.clock.now()),
            None => self.provider.is_expired(),
        }
    }

    /// Expiration of the adapter's current credential, if it holds one.
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().expect("credential cache state poisoned");
        state.cached.as_ref().map(|cached| cached.expiration)
    }
}

/// Wire a provider into the cache at the resolved default location,
/// with the system clock and real file locks. This is the constructor
/// API-client call sites use once they have decided caching is on.
pub fn cached_provider(
    profile: impl Into<String>,
    provider: Box<dyn CredentialsProvider>,
) -> Result<FileCacheProvider> {
    let path = cache_file_path()?;
    FileCacheProvider::new(
        profile,
        Some(provider),
        Arc::new(SystemClock),
        flock_factory(),
        path,
    )
}
