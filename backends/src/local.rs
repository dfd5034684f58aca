use crate::backend::{embedding_hostname, not_connected, pick, BoxReader, RemoteStorage};
use crate::walk::walk_with_deadline;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tablesnap_core::config::LocalConfig;
use tablesnap_core::{embed_hostname, join_key, Error, RemoteFile, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const KIND: &str = "local";

/// A directory used as a bucket, e.g. an NFS mount shared by replicas.
///
/// `directory` plays the bucket role, so a non-empty `override_bucket` is
/// another directory.
pub struct LocalBackend {
    config: LocalConfig,
    root: Option<PathBuf>,
    hostname: Option<String>,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        let hostname = embedding_hostname(config.path_hostname_include);
        Self {
            config,
            root: None,
            hostname,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    fn root(&self, override_bucket: &str) -> Result<PathBuf> {
        let root = self.root.as_ref().ok_or_else(|| not_connected(KIND))?;
        if override_bucket.is_empty() {
            Ok(root.clone())
        } else {
            Ok(PathBuf::from(override_bucket))
        }
    }

    fn full_path(&self, key: &str, override_bucket: &str) -> Result<PathBuf> {
        let full_key = join_key(&self.config.path, key);
        let relative = Path::new(&full_key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Validation(format!("key {:?} escapes the storage directory", key)));
        }
        Ok(self.root(override_bucket)?.join(relative))
    }

    fn upload_key(&self, key: &str) -> String {
        match &self.hostname {
            Some(hostname) if self.config.path_hostname_include => embed_hostname(key, hostname),
            _ => key.to_string(),
        }
    }
}

#[async_trait]
impl RemoteStorage for LocalBackend {
    async fn connect(&mut self, override_bucket: &str) -> Result<()> {
        let directory = pick(&self.config.directory, override_bucket);
        if directory.is_empty() {
            return Err(Error::Validation("local.directory is empty".to_string()));
        }
        let root = PathBuf::from(directory);
        fs::create_dir_all(&root).await.map_err(|e| Error::Connection {
            kind: KIND,
            message: format!("cannot create {}: {}", root.display(), e),
        })?;

        info!(directory = %root.display(), "Using local directory storage");
        self.root = Some(root);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        KIND
    }

    async fn get_file(&self, key: &str, override_bucket: &str) -> Result<RemoteFile> {
        let path = self.full_path(key, override_bucket)?;
        let metadata = fs::metadata(&path).await.map_err(|e| io_error(e, key))?;
        if !metadata.is_file() {
            return Err(Error::not_found(key));
        }
        Ok(RemoteFile::new(key, metadata.len() as i64, modified(&metadata)))
    }

    async fn get_file_reader(&self, key: &str, override_bucket: &str) -> Result<BoxReader> {
        let path = self.full_path(key, override_bucket)?;
        let file = fs::File::open(&path).await.map_err(|e| io_error(e, key))?;
        Ok(Box::pin(file))
    }

    async fn put_file(
        &self,
        key: &str,
        override_bucket: &str,
        mut reader: BoxReader,
    ) -> Result<()> {
        let key = self.upload_key(key);
        let path = self.full_path(&key, override_bucket)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let transfer = |source: io::Error| Error::Transfer {
            key: key.clone(),
            source,
        };
        let mut file = fs::File::create(&path).await.map_err(transfer)?;
        let written = tokio::io::copy(&mut reader, &mut file).await.map_err(transfer)?;
        file.flush().await.map_err(transfer)?;
        debug!(key = %key, size = written, "Wrote file");
        Ok(())
    }

    async fn delete_file(&self, key: &str, override_bucket: &str) -> Result<()> {
        let path = self.full_path(key, override_bucket)?;
        fs::remove_file(&path).await.map_err(|e| io_error(e, key))?;
        debug!(key = %key, "Deleted file");
        Ok(())
    }

    async fn walk(
        &self,
        path: &str,
        override_bucket: &str,
        override_path: &str,
        visit: &mut (dyn FnMut(RemoteFile) + Send),
    ) -> Result<()> {
        let base = self
            .root(override_bucket)?
            .join(pick(&self.config.path, override_path).trim_matches('/'));
        let prefix = path.trim_start_matches('/').to_string();
        let deadline = Duration::from_secs(self.config.timeout_secs);

        walk_with_deadline(
            KIND,
            Some(deadline),
            move |sink| async move {
                let mut pending = vec![base.clone()];
                while let Some(dir) = pending.pop() {
                    let mut entries = match fs::read_dir(&dir).await {
                        Ok(entries) => entries,
                        // A missing base directory is an empty listing.
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => {
                            sink.fail(e.into()).await;
                            return;
                        }
                    };
                    loop {
                        let entry = match entries.next_entry().await {
                            Ok(Some(entry)) => entry,
                            Ok(None) => break,
                            Err(e) => {
                                sink.fail(e.into()).await;
                                return;
                            }
                        };
                        let metadata = match entry.metadata().await {
                            Ok(metadata) => metadata,
                            Err(e) => {
                                sink.fail(e.into()).await;
                                return;
                            }
                        };
                        if metadata.is_dir() {
                            pending.push(entry.path());
                            continue;
                        }
                        let Some(name) = relative_key(&base, &entry.path()) else {
                            continue;
                        };
                        if !name.starts_with(&prefix) {
                            continue;
                        }
                        let size = metadata.len() as i64;
                        let file = RemoteFile::new(name, size, modified(&metadata));
                        if !sink.send(file).await {
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

/// `/`-separated key of `path` below `base`.
fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn modified(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

fn io_error(err: io::Error, key: &str) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::not_found(key)
    } else {
        Error::Io(err)
    }
}
