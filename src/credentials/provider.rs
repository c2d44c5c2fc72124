//! Upstream credential-provider contracts.
//!
//! The cache never mints credentials itself; it wraps a provider that
//! does. Two call conventions exist in the wild and both are supported:
//! a synchronous pull-based one and a cancellable async one. Errors
//! from either pass through the cache unchanged.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CredentialValue, Credentials};

/// Synchronous pull-based credential source.
pub trait CredentialsProvider: Send + Sync {
    /// Produce a credential value, re-authenticating if necessary.
    fn retrieve(&self) -> Result<CredentialValue>;

    /// Whether the provider considers its current credentials expired.
    fn is_expired(&self) -> bool;

    /// When the current credentials expire. Providers that cannot
    /// report an expiry return `None`; their credentials are not
    /// cacheable and the file cache will pass them through untouched.
    fn expires_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Cancellable credential source. Dropping the future returned by
/// [`retrieve`](Self::retrieve) cancels the in-flight call.
#[async_trait]
pub trait AsyncCredentialsProvider: Send + Sync {
    async fn retrieve(&self) -> Result<Credentials>;
}

/// Long-lived static keys, e.g. from environment variables. Reports no
/// expiry, so the file cache never persists them.
#[derive(Debug, Clone)]
pub struct StaticCredentialsProvider {
    value: CredentialValue,
}

impl StaticCredentialsProvider {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: impl Into<String>,
    ) -> Self {
        Self {
            value: CredentialValue {
                access_key_id: access_key_id.into(),
                secret_access_key: secret_access_key.into(),
                session_token: session_token.into(),
                provider_name: "StaticProvider".to_string(),
            },
        }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn retrieve(&self) -> Result<CredentialValue> {
        Ok(self.value.clone())
    }

    fn is_expired(&self) -> bool {
        false
    }
}
