use crate::backend::{embedding_hostname, not_connected, pick, BoxReader, RemoteStorage};
use crate::transfer::read_part;
use crate::walk::walk_with_deadline;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tablesnap_core::config::GcsConfig;
use tablesnap_core::{embed_hostname, join_key, strip_prefix, Error, RemoteFile, Result};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

const KIND: &str = "GCS";

/// Google Cloud Storage through the `object_store` GCS client.
///
/// The client is bound to one bucket, so a call with a different
/// `override_bucket` builds a short-lived client for that bucket.
pub struct GcsBackend {
    config: GcsConfig,
    session: Option<(String, Arc<dyn ObjectStore>)>,
    hostname: Option<String>,
}

impl GcsBackend {
    pub fn new(config: GcsConfig) -> Self {
        let hostname = embedding_hostname(config.path_hostname_include);
        Self {
            config,
            session: None,
            hostname,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Uses `store` as the already connected client of `bucket`.
    pub fn with_store(mut self, bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        self.session = Some((bucket.into(), store));
        self
    }

    fn build_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let options = ClientOptions::new()
            .with_connect_timeout(Duration::from_secs(self.config.timeout_secs))
            .with_timeout_disabled()
            .with_allow_invalid_certificates(self.config.disable_cert_verification);

        let mut builder = if !self.config.credentials_json.is_empty() {
            GoogleCloudStorageBuilder::new()
                .with_service_account_key(&self.config.credentials_json)
        } else if !self.config.credentials_file.is_empty() {
            GoogleCloudStorageBuilder::new()
                .with_service_account_path(&self.config.credentials_file)
        } else {
            // Application default credentials from the environment.
            GoogleCloudStorageBuilder::from_env()
        };
        builder = builder.with_bucket_name(bucket).with_client_options(options);

        let store = builder.build().map_err(|e| Error::Connection {
            kind: KIND,
            message: e.to_string(),
        })?;
        Ok(Arc::new(store))
    }

    fn store(&self, override_bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        let (bucket, store) = self.session.as_ref().ok_or_else(|| not_connected(KIND))?;
        if override_bucket.is_empty() || override_bucket == bucket {
            Ok(store.clone())
        } else {
            self.build_store(override_bucket)
        }
    }

    fn object_path(&self, key: &str) -> ObjectPath {
        ObjectPath::from(join_key(&self.config.path, key))
    }

    fn upload_key(&self, key: &str) -> String {
        match &self.hostname {
            Some(hostname) if self.config.path_hostname_include => embed_hostname(key, hostname),
            _ => key.to_string(),
        }
    }
}

#[async_trait]
impl RemoteStorage for GcsBackend {
    async fn connect(&mut self, override_bucket: &str) -> Result<()> {
        let bucket = pick(&self.config.bucket, override_bucket).to_string();
        let store = self.build_store(&bucket)?;

        // Fetching the first listing entry is enough to prove credentials and bucket.
        let probe = join_key(&self.config.path, "");
        let prefix = (!probe.is_empty()).then(|| ObjectPath::from(probe));
        if let Some(Err(e)) = store.list(prefix.as_ref()).next().await {
            return Err(Error::Connection {
                kind: KIND,
                message: format!("bucket {} not accessible: {}", bucket, e),
            });
        }

        info!(bucket = %bucket, "Connected to GCS");
        self.session = Some((bucket, store));
        Ok(())
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn get_file(&self, key: &str, override_bucket: &str) -> Result<RemoteFile> {
        let path = self.object_path(key);
        let meta = self
            .store(override_bucket)?
            .head(&path)
            .await
            .map_err(|e| gcs_error(e, key))?;
        Ok(RemoteFile::new(key, meta.size as i64, meta.last_modified))
    }

    async fn get_file_reader(&self, key: &str, override_bucket: &str) -> Result<BoxReader> {
        let path = self.object_path(key);
        let result = self
            .store(override_bucket)?
            .get(&path)
            .await
            .map_err(|e| gcs_error(e, key))?;
        let stream = result
            .into_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn put_file(
        &self,
        key: &str,
        override_bucket: &str,
        mut reader: BoxReader,
    ) -> Result<()> {
        let store = self.store(override_bucket)?;
        let key = self.upload_key(key);
        let path = self.object_path(&key);
        let part_size = self.config.part_size;

        let first = read_part(&mut reader, &key, part_size).await?;
        if first.len() < part_size {
            debug!(key = %path, size = first.len(), "Single request upload");
            store
                .put(&path, PutPayload::from(first))
                .await
                .map_err(|e| gcs_error(e, &key))?;
            return Ok(());
        }

        debug!(key = %path, part_size, "Multipart upload");
        let upload = store
            .put_multipart(&path)
            .await
            .map_err(|e| gcs_error(e, &key))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, part_size);

        let streamed = async {
            let mut chunk = first;
            while !chunk.is_empty() {
                // Blocks while `concurrency` parts are still in flight.
                writer
                    .wait_for_capacity(self.config.concurrency)
                    .await
                    .map_err(|e| gcs_error(e, &key))?;
                writer.write(&chunk);
                chunk = read_part(&mut reader, &key, part_size).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        match streamed {
            Ok(()) => {
                writer.finish().await.map_err(|e| gcs_error(e, &key))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    warn!(key = %path, error = %abort, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn delete_file(&self, key: &str, override_bucket: &str) -> Result<()> {
        let store = self.store(override_bucket)?;
        let path = self.object_path(key);
        store.head(&path).await.map_err(|e| gcs_error(e, key))?;
        store.delete(&path).await.map_err(|e| gcs_error(e, key))?;
        debug!(key = %path, "Deleted object");
        Ok(())
    }

    async fn walk(
        &self,
        path: &str,
        override_bucket: &str,
        override_path: &str,
        visit: &mut (dyn FnMut(RemoteFile) + Send),
    ) -> Result<()> {
        let store = self.store(override_bucket)?;
        let base = pick(&self.config.path, override_path).to_string();
        let prefix = join_key(&base, path);
        let deadline = Duration::from_secs(self.config.timeout_secs);

        // object_store follows page tokens internally; each item is one object.
        walk_with_deadline(
            KIND,
            Some(deadline),
            move |sink| async move {
                let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
                let mut listing = store.list(prefix.as_ref());
                while let Some(item) = listing.next().await {
                    match item {
                        Ok(meta) => {
                            if !sink.send(to_remote_file(&base, &meta)).await {
                                return;
                            }
                        }
                        Err(e) => {
                            sink.fail(Error::backend(KIND, e)).await;
                            return;
                        }
                    }
                }
            },
            visit,
        )
        .await
    }
}

fn to_remote_file(base: &str, meta: &ObjectMeta) -> RemoteFile {
    RemoteFile::new(
        strip_prefix(base, meta.location.as_ref()),
        meta.size as i64,
        meta.last_modified,
    )
}

fn gcs_error(err: object_store::Error, key: &str) -> Error {
    match err {
        object_store::Error::NotFound { .. } => Error::not_found(key),
        other => Error::backend(KIND, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use object_store::memory::InMemory;
    use tokio::io::AsyncReadExt;

    const PART: usize = 64;

    fn in_memory(config: GcsConfig) -> (GcsBackend, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        let config = GcsConfig {
            bucket: "backups".to_string(),
            part_size: PART,
            concurrency: 2,
            timeout_secs: 5,
            ..config
        };
        let backend = GcsBackend::new(config).with_store("backups", store.clone());
        (backend, store)
    }

    fn body(data: Vec<u8>) -> BoxReader {
        Box::pin(std::io::Cursor::new(data))
    }

    async fn read_back(backend: &GcsBackend, key: &str) -> Vec<u8> {
        let mut reader = backend.get_file_reader(key, "").await.unwrap();
        let mut read = Vec::new();
        reader.read_to_end(&mut read).await.unwrap();
        read
    }

    async fn names(backend: &GcsBackend, path: &str) -> Vec<String> {
        let mut names = Vec::new();
        let mut visit = |file: RemoteFile| names.push(file.name);
        backend.walk(path, "", "", &mut visit).await.unwrap();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_small_body_is_a_single_put() {
        let (gcs, store) = in_memory(GcsConfig {
            path: "cluster".to_string(),
            ..Default::default()
        });

        gcs.put_file("b1/meta.json", "", body(b"{}".to_vec())).await.unwrap();
        let meta = gcs.get_file("b1/meta.json", "").await.unwrap();
        assert_eq!(meta.name, "b1/meta.json");
        assert_eq!(meta.size, 2);
        assert!(store.head(&ObjectPath::from("cluster/b1/meta.json")).await.is_ok());
        assert_eq!(read_back(&gcs, "b1/meta.json").await, b"{}");
    }

    #[tokio::test]
    async fn test_large_body_is_uploaded_in_parts() {
        let (gcs, store) = in_memory(GcsConfig {
            path: "cluster".to_string(),
            ..Default::default()
        });
        let data: Vec<u8> = (0..PART * 3 + 10).map(|i| (i % 251) as u8).collect();

        gcs.put_file("b1/data.bin", "", body(data.clone())).await.unwrap();
        let stored = store.head(&ObjectPath::from("cluster/b1/data.bin")).await.unwrap();
        assert_eq!(stored.size, data.len());
        assert_eq!(read_back(&gcs, "b1/data.bin").await, data);

        // Exactly one part still goes through the multipart path.
        let exact: Vec<u8> = vec![7; PART];
        gcs.put_file("b1/exact.bin", "", body(exact.clone())).await.unwrap();
        assert_eq!(read_back(&gcs, "b1/exact.bin").await, exact);
    }

    #[tokio::test]
    async fn test_walk_lists_relative_names_with_hostname() {
        let (gcs, _store) = in_memory(GcsConfig {
            path: "cluster".to_string(),
            path_hostname_include: true,
            ..Default::default()
        });
        let gcs = gcs.with_hostname("h1");

        gcs.put_file("dir/name.ext", "", body(b"abc".to_vec())).await.unwrap();
        gcs.put_file("other/x.ext", "", body(vec![1; PART * 2])).await.unwrap();

        assert_eq!(names(&gcs, "").await, vec!["dir/h1_name.ext", "other/h1_x.ext"]);
        assert_eq!(names(&gcs, "dir").await, vec!["dir/h1_name.ext"]);
        assert_eq!(gcs.get_file("dir/h1_name.ext", "").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let (gcs, _store) = in_memory(GcsConfig::default());

        let err = gcs.get_file("nope", "").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { ref key } if key == "nope"));
        assert!(matches!(gcs.get_file_reader("nope", "").await, Err(Error::NotFound { .. })));
        assert!(gcs.delete_file("nope", "").await.unwrap_err().is_not_found());

        gcs.put_file("once", "", body(b"x".to_vec())).await.unwrap();
        gcs.delete_file("once", "").await.unwrap();
        assert!(gcs.delete_file("once", "").await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_object_path_joins_prefix() {
        let gcs = GcsBackend::new(GcsConfig {
            path: "cluster-1/".to_string(),
            ..Default::default()
        });
        assert_eq!(gcs.object_path("2024/backup.tar").as_ref(), "cluster-1/2024/backup.tar");
    }

    #[test]
    fn test_remote_file_is_relative_to_base() {
        let meta = ObjectMeta {
            location: ObjectPath::from("cluster-1/a/h1_b.tar"),
            last_modified: Utc::now(),
            size: 42,
            e_tag: None,
            version: None,
        };
        let file = to_remote_file("cluster-1", &meta);
        assert_eq!(file.name, "a/h1_b.tar");
        assert_eq!(file.size, 42);
    }

    #[test]
    fn test_not_found_is_mapped() {
        let err = gcs_error(
            object_store::Error::NotFound {
                path: "cluster/a/b".to_string(),
                source: "404".into(),
            },
            "a/b",
        );
        assert!(matches!(err, Error::NotFound { ref key } if key == "a/b"));
    }

    #[test]
    fn test_upload_key_embeds_hostname() {
        let gcs = GcsBackend::new(GcsConfig {
            path_hostname_include: true,
            ..Default::default()
        })
        .with_hostname("h1");
        assert_eq!(gcs.upload_key("dir/name.ext"), "dir/h1_name.ext");
    }
}
