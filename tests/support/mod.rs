use std::fs;
use std::path::Path;

/// Write cache file content with owner-only permissions, the way the
/// cache itself would have written it.
pub fn seed_cache(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
    make_private(path);
}

pub fn make_private(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

/// A one-profile cache document in the persisted format.
pub fn cache_document(
    profile: &str,
    access_key_id: &str,
    secret_access_key: &str,
    session_token: &str,
    expiration: &str,
) -> String {
    format!(
        "profiles:\n  {profile}:\n    credential:\n      access_key_id: {access_key_id}\n      secret_access_key: {secret_access_key}\n      session_token: {session_token}\n      provider_name: cloudlift-test\n    expiration: {expiration}\n"
    )
}

/// Parse the cache file and return one profile's entry as YAML values:
/// `(access_key_id, expiration)`.
pub fn read_profile_entry(path: &Path, profile: &str) -> Option<(String, String)> {
    let data = fs::read_to_string(path).ok()?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&data).ok()?;
    let entry = doc.get("profiles")?.get(profile)?;
    let access_key_id = entry
        .get("credential")?
        .get("access_key_id")?
        .as_str()?
        .to_string();
    let expiration = entry.get("expiration")?.as_str()?.to_string();
    Some((access_key_id, expiration))
}
