use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};

use cloudlift::clock::FixedClock;
use cloudlift::credentials::{
    flock_factory, CredentialValue, CredentialsProvider, FileCacheProvider,
    StaticCredentialsProvider,
};

mod support;
use support::{cache_document, read_profile_entry, seed_cache};

struct ExpiringProvider {
    value: CredentialValue,
    expiration: DateTime<Utc>,
    calls: Arc<AtomicUsize>,
}

impl ExpiringProvider {
    fn new(access_key_id: &str, expiration: DateTime<Utc>) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Self {
            value: CredentialValue {
                access_key_id: access_key_id.to_string(),
                secret_access_key: format!("secret-{access_key_id}"),
                session_token: format!("token-{access_key_id}"),
                provider_name: "cloudlift-test".to_string(),
            },
            expiration,
            calls: calls.clone(),
        };
        (provider, calls)
    }
}

impl CredentialsProvider for ExpiringProvider {
    fn retrieve(&self) -> Result<CredentialValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.clone())
    }

    fn is_expired(&self) -> bool {
        true
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(self.expiration)
    }
}

/// Errors on any retrieve call, for asserting the cache never consults
/// its upstream.
struct UnreachableProvider;

impl CredentialsProvider for UnreachableProvider {
    fn retrieve(&self) -> Result<CredentialValue> {
        bail!("unexpected call to retrieve")
    }

    fn is_expired(&self) -> bool {
        true
    }

    fn expires_at(&self) -> Option<DateTime<Utc>> {
        Some(DateTime::<Utc>::UNIX_EPOCH)
    }
}

fn clock_at(year: i32) -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).unwrap(),
    ))
}

#[test]
fn first_retrieve_writes_the_cache_and_a_second_adapter_serves_from_it() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("credentials.yaml");

    let expiration = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let (provider, calls) = ExpiringProvider::new("id", expiration);
    let cache = FileCacheProvider::new(
        "profile",
        Some(Box::new(provider)),
        clock_at(2026),
        flock_factory(),
        path.clone(),
    )?;

    let value = cache.retrieve()?;
    assert_eq!(value.access_key_id, "id");
    assert_eq!(value.secret_access_key, "secret-id");
    assert_eq!(value.session_token, "token-id");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!cache.is_expired());
    assert_eq!(cache.expires_at(), Some(expiration));

    let (written_key, written_expiration) = read_profile_entry(&path, "profile").unwrap();
    assert_eq!(written_key, "id");
    assert_eq!(written_expiration, "2030-01-01T00:00:00Z");

    // a second adapter against the same file must not touch its upstream
    let second = FileCacheProvider::new(
        "profile",
        Some(Box::new(UnreachableProvider)),
        clock_at(2026),
        flock_factory(),
        path,
    )?;
    let served = second.retrieve()?;
    assert_eq!(served, value);
    Ok(())
}

#[test]
fn a_live_preexisting_entry_is_served_without_an_upstream_call() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("credentials.yaml");
    seed_cache(
        &path,
        &cache_document("profile", "stored", "stored-secret", "stored-token", "9999-01-01T00:00:00Z"),
    );

    let cache = FileCacheProvider::new(
        "profile",
        Some(Box::new(UnreachableProvider)),
        clock_at(2026),
        flock_factory(),
        path,
    )?;

    let value = cache.retrieve()?;
    assert_eq!(value.access_key_id, "stored");
    assert_eq!(value.secret_access_key, "stored-secret");
    assert_eq!(value.session_token, "stored-token");
    Ok(())
}

#[test]
fn an_entry_expiring_at_the_clock_time_triggers_exactly_one_upstream_call() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("credentials.yaml");
    // expiration equal to "now" is already expired
    seed_cache(
        &path,
        &cache_document("profile", "stale", "s", "t", "2026-01-01T00:00:00Z"),
    );

    let fresh_expiration = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let (provider, calls) = ExpiringProvider::new("fresh", fresh_expiration);
    let cache = FileCacheProvider::new(
        "profile",
        Some(Box::new(provider)),
        clock_at(2026),
        flock_factory(),
        path.clone(),
    )?;

    let value = cache.retrieve()?;
    assert_eq!(value.access_key_id, "fresh");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // the refresh supersedes the stale entry in place
    let (written_key, _) = read_profile_entry(&path, "profile").unwrap();
    assert_eq!(written_key, "fresh");

    // the refreshed value is memoized, not re-fetched
    cache.retrieve()?;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn a_provider_without_expiry_support_is_never_cached() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("credentials.yaml");

    let cache = FileCacheProvider::new(
        "profile",
        Some(Box::new(StaticCredentialsProvider::new("id", "secret", "token"))),
        clock_at(2026),
        flock_factory(),
        path.clone(),
    )?;

    let value = cache.retrieve()?;
    assert_eq!(value.access_key_id, "id");
    assert!(!path.exists());
    Ok(())
}

#[test]
fn refreshing_one_profile_leaves_other_profiles_in_place() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("credentials.yaml");
    seed_cache(
        &path,
        &cache_document("other", "other-key", "s", "t", "9999-01-01T00:00:00Z"),
    );

    let expiration = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let (provider, _calls) = ExpiringProvider::new("mine", expiration);
    let cache = FileCacheProvider::new(
        "profile",
        Some(Box::new(provider)),
        clock_at(2026),
        flock_factory(),
        path.clone(),
    )?;
    cache.retrieve()?;

    let (mine, _) = read_profile_entry(&path, "profile").unwrap();
    assert_eq!(mine, "mine");
    let (other, other_expiration) = read_profile_entry(&path, "other").unwrap();
    assert_eq!(other, "other-key");
    assert_eq!(other_expiration, "9999-01-01T00:00:00Z");
    Ok(())
}

#[test]
fn constructing_without_a_provider_fails_before_any_io() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("never-created").join("credentials.yaml");

    let err = FileCacheProvider::new(
        "profile",
        None,
        clock_at(2026),
        flock_factory(),
        path.clone(),
    )
    .unwrap_err();

    assert!(err
        .to_string()
        .contains("no underlying credentials provider"));
    // the guard fires before the cache directory materializes
    assert!(!path.parent().unwrap().exists());
}

#[cfg(unix)]
#[test]
fn a_cache_file_readable_by_others_is_refused() {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("credentials.yaml");
    fs::write(&path, "profiles: {}\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    let err = FileCacheProvider::new(
        "profile",
        Some(Box::new(UnreachableProvider)),
        clock_at(2026),
        flock_factory(),
        path.clone(),
    )
    .unwrap_err();

    let message = format!("{err:#}");
    assert!(message.contains("is not private"));
    assert!(message.contains(&path.display().to_string()));
}

#[test]
fn a_corrupt_cache_file_is_surfaced_not_discarded() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("credentials.yaml");
    seed_cache(&path, "profiles: [not, a, mapping");

    let err = FileCacheProvider::new(
        "profile",
        Some(Box::new(UnreachableProvider)),
        clock_at(2026),
        flock_factory(),
        path,
    )
    .unwrap_err();

    assert!(format!("{err:#}").contains("unable to parse"));
}
