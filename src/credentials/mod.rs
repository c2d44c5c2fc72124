//! Credential caching for cloud control-plane access.
//!
//! Every authenticated call cloudlift makes goes through one of two
//! adapters here. Both consult a shared on-disk cache keyed by profile
//! name, so repeated invocations of the tool (including concurrent
//! ones from unrelated processes) skip interactive re-authentication
//! and avoidable network round trips. [`FileCacheProvider`] wraps a
//! synchronous pull-based provider; [`AsyncFileCache`] wraps a
//! cancellable one and memoizes in-process. They share one cache file
//! format and cooperate on the same file through advisory locks.
//!
//! The cache file holds live secret material. It is created owner-only
//! and refused outright when its permissions are any broader than
//! that. Consumers obtain credentials exclusively through the
//! adapters, never by touching the store directly.

mod async_cache;
mod cache;
mod file_cache;
mod lock;
mod provider;

pub use async_cache::AsyncFileCache;
pub use cache::{
    cache_file_path, credential_cache_enabled, CacheError, CACHE_FILENAME_ENV, ENABLE_CACHE_ENV,
};
pub use file_cache::{cached_provider, FileCacheProvider};
pub use lock::{
    flock_factory, FileLock, Flock, LockError, LockFactory, LOCK_RETRY_DELAY, LOCK_TIMEOUT,
};
pub use provider::{AsyncCredentialsProvider, CredentialsProvider, StaticCredentialsProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The secret material itself. Opaque to the cache: stored and
/// returned verbatim, never interpreted.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialValue {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Which upstream provider produced this value.
    pub provider_name: String,
}

impl std::fmt::Debug for CredentialValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // the secret fields must never end up in logs or panic output
        f.debug_struct("CredentialValue")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("provider_name", &self.provider_name)
            .finish()
    }
}

/// Credentials as returned by a context-aware provider: the value plus
/// the provider's own notion of expiry. `None` means the credentials
/// cannot expire, and such credentials are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub value: CredentialValue,
    pub expires_at: Option<DateTime<Utc>>,
}
