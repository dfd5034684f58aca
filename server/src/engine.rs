use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tablesnap_backends::{new_remote_storage, RemoteStorage};
use tablesnap_core::{Config, Error, RemoteFile, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use walkdir::WalkDir;

/// One backup as seen locally or remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub name: String,
    pub size: i64,
    pub created: DateTime<Utc>,
}

/// The backup operations the control server exposes.
///
/// Table patterns are passed through untouched; an empty pattern means all
/// tables.
#[async_trait]
pub trait BackupEngine: Send + Sync {
    async fn tables(&self) -> Result<Vec<String>>;

    async fn list_local(&self) -> Result<Vec<BackupSummary>>;

    async fn list_remote(&self) -> Result<Vec<BackupSummary>>;

    /// Returns the name of the created backup, generated when `name` is empty.
    /// `freeze_one_by_one` freezes each table separately instead of all at once.
    async fn create_backup(
        &self,
        name: &str,
        table_pattern: &str,
        freeze_one_by_one: bool,
    ) -> Result<String>;

    async fn freeze(&self, table_pattern: &str) -> Result<()>;

    /// Empties the staging area.
    async fn clean(&self) -> Result<()>;

    /// `diff_from` names an earlier remote backup this one is relative to.
    async fn upload(&self, name: &str, diff_from: &str) -> Result<()>;

    async fn download(&self, name: &str) -> Result<()>;

    async fn restore(
        &self,
        name: &str,
        table_pattern: &str,
        schema_only: bool,
        data_only: bool,
    ) -> Result<()>;

    async fn remove_local(&self, name: &str) -> Result<()>;

    async fn remove_remote(&self, name: &str) -> Result<()>;
}

/// Builds the engine of a server generation from its configuration.
pub type EngineFactory = Arc<dyn Fn(&Config) -> Arc<dyn BackupEngine> + Send + Sync>;

pub fn archive_engine_factory() -> EngineFactory {
    Arc::new(|config: &Config| {
        Arc::new(ArchiveEngine::new(config.clone())) as Arc<dyn BackupEngine>
    })
}

/// Storage side of the backup workflow: moves backup directories between
/// `general.backups_path` and the configured remote storage.
///
/// Every remote call connects a fresh adapter, so a configuration reload
/// never leaves a stale session behind.
pub struct ArchiveEngine {
    config: Config,
}

impl ArchiveEngine {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    async fn remote(&self) -> Result<Box<dyn RemoteStorage>> {
        let mut storage = new_remote_storage(&self.config)?;
        storage.connect("").await?;
        Ok(storage)
    }

    fn backup_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.config.general.backups_dir().join(name))
    }
}

#[async_trait]
impl BackupEngine for ArchiveEngine {
    async fn tables(&self) -> Result<Vec<String>> {
        Err(Error::Unsupported("listing tables".to_string()))
    }

    async fn list_local(&self) -> Result<Vec<BackupSummary>> {
        let root = self.config.general.backups_dir();
        tokio::task::spawn_blocking(move || local_backups(&root))
            .await
            .map_err(|e| Error::Other(format!("listing task failed: {}", e)))?
    }

    async fn list_remote(&self) -> Result<Vec<BackupSummary>> {
        let storage = self.remote().await?;
        let mut backups: BTreeMap<String, BackupSummary> = BTreeMap::new();
        let mut visit = |file: RemoteFile| {
            let Some((name, _)) = file.name.split_once('/') else {
                return;
            };
            let entry = backups.entry(name.to_string()).or_insert_with(|| BackupSummary {
                name: name.to_string(),
                size: 0,
                created: file.last_modified,
            });
            entry.size += file.size;
            entry.created = entry.created.max(file.last_modified);
        };
        storage.walk("", "", "", &mut visit).await?;
        Ok(backups.into_values().collect())
    }

    async fn create_backup(
        &self,
        _name: &str,
        _table_pattern: &str,
        _freeze_one_by_one: bool,
    ) -> Result<String> {
        Err(Error::Unsupported("creating backups".to_string()))
    }

    async fn freeze(&self, _table_pattern: &str) -> Result<()> {
        Err(Error::Unsupported("freezing tables".to_string()))
    }

    async fn clean(&self) -> Result<()> {
        let shadow = self.config.general.shadow_dir();
        let mut entries = match fs::read_dir(&shadow).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %shadow.display(), "Nothing to clean");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(entry.path()).await?;
            } else {
                fs::remove_file(entry.path()).await?;
            }
            removed += 1;
        }
        info!(path = %shadow.display(), removed, "Cleaned staging area");
        Ok(())
    }

    async fn upload(&self, name: &str, diff_from: &str) -> Result<()> {
        let source = self.backup_dir(name)?;
        if !fs::try_exists(&source).await? {
            return Err(Error::not_found(name));
        }
        let storage = self.remote().await?;

        if !diff_from.is_empty() {
            validate_name(diff_from)?;
            if objects_under(storage.as_ref(), diff_from).await?.is_empty() {
                return Err(Error::not_found(diff_from));
            }
            info!(backup = name, diff_from, "Uploading relative to an earlier backup");
        }

        let files = tokio::task::spawn_blocking(move || local_files(&source))
            .await
            .map_err(|e| Error::Other(format!("listing task failed: {}", e)))??;

        let mut bytes = 0u64;
        for (relative, path, size) in &files {
            let key = format!("{}/{}", name, relative);
            let file = fs::File::open(path).await?;
            storage.put_file(&key, "", Box::pin(file)).await?;
            bytes += size;
            debug!(key = %key, size, "Uploaded");
        }
        info!(backup = name, files = files.len(), bytes, kind = storage.kind(), "Upload finished");
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<()> {
        let target = self.backup_dir(name)?;
        let storage = self.remote().await?;
        let files = objects_under(storage.as_ref(), name).await?;
        if files.is_empty() {
            return Err(Error::not_found(name));
        }

        let root = self.config.general.backups_dir();
        let mut bytes = 0i64;
        for file in &files {
            let path = root.join(safe_relative(&file.name)?);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut reader = storage.get_file_reader(&file.name, "").await?;
            let mut out = fs::File::create(&path).await?;
            tokio::io::copy(&mut reader, &mut out).await.map_err(|source| Error::Transfer {
                key: file.name.clone(),
                source,
            })?;
            out.flush().await?;
            bytes += file.size;
        }
        info!(
            backup = name,
            files = files.len(),
            bytes,
            path = %target.display(),
            "Download finished"
        );
        Ok(())
    }

    async fn restore(
        &self,
        _name: &str,
        _table_pattern: &str,
        _schema_only: bool,
        _data_only: bool,
    ) -> Result<()> {
        Err(Error::Unsupported("restoring tables".to_string()))
    }

    async fn remove_local(&self, name: &str) -> Result<()> {
        let path = self.backup_dir(name)?;
        fs::remove_dir_all(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(name),
            _ => Error::Io(e),
        })?;
        info!(backup = name, "Removed local backup");
        Ok(())
    }

    async fn remove_remote(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let storage = self.remote().await?;
        let files = objects_under(storage.as_ref(), name).await?;
        if files.is_empty() {
            return Err(Error::not_found(name));
        }
        for file in &files {
            storage.delete_file(&file.name, "").await?;
        }
        info!(backup = name, objects = files.len(), "Removed remote backup");
        Ok(())
    }
}

/// Every remote object of backup `name`.
async fn objects_under(storage: &dyn RemoteStorage, name: &str) -> Result<Vec<RemoteFile>> {
    let prefix = format!("{}/", name);
    let mut files = Vec::new();
    let mut visit = |file: RemoteFile| {
        // Listing prefixes are plain string prefixes; `b1/` must not match `b10/`.
        if file.name.starts_with(&prefix) {
            files.push(file);
        }
    };
    storage.walk(&prefix, "", "", &mut visit).await?;
    Ok(files)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(Error::Validation(format!("invalid backup name {:?}", name)));
    }
    Ok(())
}

/// Rejects remote keys that would escape the backups directory.
fn safe_relative(key: &str) -> Result<&Path> {
    let path = Path::new(key);
    if path.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(path)
    } else {
        Err(Error::Validation(format!("refusing to download {:?}", key)))
    }
}

fn local_backups(root: &Path) -> Result<Vec<BackupSummary>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_dir() {
            continue;
        }
        let size = local_files(&entry.path())?
            .iter()
            .map(|(_, _, size)| *size as i64)
            .sum();
        let created = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        backups.push(BackupSummary {
            name: entry.file_name().to_string_lossy().into_owned(),
            size,
            created,
        });
    }
    backups.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(backups)
}

/// Regular files below `root` as `(key relative to root, path, size)`.
fn local_files(root: &Path) -> Result<Vec<(String, PathBuf, u64)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Other(format!("walking {}: {}", root.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Other(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .map_err(|e| Error::Other(format!("reading {}: {}", entry.path().display(), e)))?
            .len();
        files.push((relative, entry.path().to_path_buf(), size));
    }
    Ok(files)
}
