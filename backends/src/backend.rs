use async_trait::async_trait;
use std::pin::Pin;
use tablesnap_core::{Config, Error, RemoteFile, RemoteStorageKind, Result};
use tokio::io::AsyncRead;
use tracing::warn;

use crate::{CosBackend, GcsBackend, LocalBackend, S3Backend};

/// Streaming body handed out by [`RemoteStorage::get_file_reader`] and taken by
/// [`RemoteStorage::put_file`]. Dropping it closes the underlying connection.
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Capability set every remote storage adapter provides.
///
/// Keys are relative to the adapter's configured `path` prefix. A non-empty
/// `override_bucket` or `override_path` always wins over the static
/// configuration. Adapters never retry: one failed call is one error.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Builds a fresh session and probes the bucket. Replaces any previous
    /// session, so it is safe to call again after a configuration reload.
    async fn connect(&mut self, override_bucket: &str) -> Result<()>;

    fn kind(&self) -> &'static str;

    /// Metadata only. A missing object yields [`Error::NotFound`].
    async fn get_file(&self, key: &str, override_bucket: &str) -> Result<RemoteFile>;

    async fn get_file_reader(&self, key: &str, override_bucket: &str) -> Result<BoxReader>;

    /// Streams `reader` to `key`, in parts of the configured size when the
    /// body is larger than one part.
    async fn put_file(&self, key: &str, override_bucket: &str, reader: BoxReader) -> Result<()>;

    /// A missing object yields [`Error::NotFound`].
    async fn delete_file(&self, key: &str, override_bucket: &str) -> Result<()>;

    /// Visits every object under `path` exactly once, in backend order.
    async fn walk(
        &self,
        path: &str,
        override_bucket: &str,
        override_path: &str,
        visit: &mut (dyn FnMut(RemoteFile) + Send),
    ) -> Result<()>;
}

/// Builds the adapter selected by `general.remote_storage`. The adapter still
/// has to be connected.
pub fn new_remote_storage(config: &Config) -> Result<Box<dyn RemoteStorage>> {
    match config.general.remote_storage {
        RemoteStorageKind::S3 => Ok(Box::new(S3Backend::new(config.s3.clone()))),
        RemoteStorageKind::Gcs => Ok(Box::new(GcsBackend::new(config.gcs.clone()))),
        RemoteStorageKind::Cos => Ok(Box::new(CosBackend::new(config.cos.clone()))),
        RemoteStorageKind::Local => Ok(Box::new(LocalBackend::new(config.local.clone()))),
        RemoteStorageKind::None => Err(Error::Validation(
            "remote storage is disabled (general.remote_storage = \"none\")".to_string(),
        )),
    }
}

/// Picks the override when set, the configured value otherwise.
pub(crate) fn pick<'a>(configured: &'a str, override_value: &'a str) -> &'a str {
    if override_value.is_empty() {
        configured
    } else {
        override_value
    }
}

/// Hostname used for key embedding, resolved once per adapter.
pub(crate) fn embedding_hostname(enabled: bool) -> Option<String> {
    if !enabled {
        return None;
    }
    match hostname::get() {
        Ok(name) => name.into_string().ok(),
        Err(e) => {
            warn!(error = %e, "Cannot resolve hostname, keys will not embed it");
            None
        }
    }
}

pub(crate) fn not_connected(kind: &'static str) -> Error {
    Error::Connection {
        kind,
        message: "connect() has not been called".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_prefers_override() {
        assert_eq!(pick("configured", ""), "configured");
        assert_eq!(pick("configured", "other"), "other");
    }

    #[test]
    fn test_factory_selects_variant() {
        let mut config = Config::default();
        for (kind, expected) in [
            (RemoteStorageKind::S3, "S3"),
            (RemoteStorageKind::Gcs, "GCS"),
            (RemoteStorageKind::Cos, "COS"),
            (RemoteStorageKind::Local, "local"),
        ] {
            config.general.remote_storage = kind;
            assert_eq!(new_remote_storage(&config).unwrap().kind(), expected);
        }
        config.general.remote_storage = RemoteStorageKind::None;
        assert!(matches!(new_remote_storage(&config), Err(Error::Validation(_))));
    }
}
