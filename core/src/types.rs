use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata of a single remote object as observed by one call.
///
/// The value is a snapshot: it is never cached and may be stale as soon as
/// the call that produced it returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Key relative to the backend's configured prefix.
    pub name: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

impl RemoteFile {
    pub fn new(name: impl Into<String>, size: i64, last_modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            last_modified,
        }
    }
}

/// Joins a backend prefix and a relative key with exactly one separator.
pub fn join_key(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let key = key.trim_start_matches('/');
    match (prefix.is_empty(), key.is_empty()) {
        (true, _) => key.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, key),
    }
}

/// Strips a backend prefix from a full key, the inverse of [`join_key`].
///
/// Keys outside the prefix are returned unchanged.
pub fn strip_prefix<'a>(prefix: &str, full_key: &'a str) -> &'a str {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return full_key;
    }
    full_key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(full_key)
}

/// Rewrites `dir/base` to `dir/<hostname>_base`.
///
/// Keys without a directory component become `<hostname>_base`.
pub fn embed_hostname(key: &str, hostname: &str) -> String {
    match key.rsplit_once('/') {
        Some((dir, base)) => format!("{}/{}_{}", dir, hostname, base),
        None => format!("{}_{}", hostname, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "a/b.tar"), "a/b.tar");
        assert_eq!(join_key("backups/", "a/b.tar"), "backups/a/b.tar");
        assert_eq!(join_key("/backups", "/a"), "backups/a");
        assert_eq!(join_key("backups", ""), "backups");
    }

    #[test]
    fn test_strip_prefix() {
        assert_eq!(strip_prefix("backups", "backups/a/b.tar"), "a/b.tar");
        assert_eq!(strip_prefix("", "a/b.tar"), "a/b.tar");
        assert_eq!(strip_prefix("backups", "backups2/x"), "backups2/x");
        assert_eq!(strip_prefix("backups/", "backups/x"), "x");
    }

    #[test]
    fn test_embed_hostname() {
        assert_eq!(embed_hostname("dir/name.ext", "h1"), "dir/h1_name.ext");
        assert_eq!(embed_hostname("a/b/c.tar", "db-2"), "a/b/db-2_c.tar");
        assert_eq!(embed_hostname("name.ext", "h1"), "h1_name.ext");
    }
}
