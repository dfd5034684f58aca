use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tablesnap/config.toml";

/// Smallest part size S3-compatible multipart uploads accept.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteStorageKind {
    None,
    S3,
    Gcs,
    Cos,
    Local,
}

impl RemoteStorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStorageKind::None => "none",
            RemoteStorageKind::S3 => "s3",
            RemoteStorageKind::Gcs => "gcs",
            RemoteStorageKind::Cos => "cos",
            RemoteStorageKind::Local => "local",
        }
    }
}

/// Complete process configuration, loaded from a TOML document.
///
/// Every section falls back to its defaults, so a partial document is
/// valid as long as [`Config::validate`] accepts the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub api: ApiConfig,
    pub s3: S3Config,
    pub gcs: GcsConfig,
    pub cos: CosConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub remote_storage: RemoteStorageKind,
    /// Database data directory; its `shadow` subdirectory is the staging area.
    pub data_path: String,
    /// Local backups directory. Empty means `<data_path>/backup`.
    pub backups_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            remote_storage: RemoteStorageKind::None,
            data_path: "/var/lib/clickhouse".to_string(),
            backups_path: String::new(),
        }
    }
}

impl GeneralConfig {
    pub fn backups_dir(&self) -> PathBuf {
        if self.backups_path.is_empty() {
            Path::new(&self.data_path).join("backup")
        } else {
            PathBuf::from(&self.backups_path)
        }
    }

    pub fn shadow_dir(&self) -> PathBuf {
        Path::new(&self.data_path).join("shadow")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
    pub enable_metrics: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:7171".to_string(),
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub acl: String,
    pub force_path_style: bool,
    pub path: String,
    pub disable_ssl: bool,
    pub disable_cert_verification: bool,
    pub part_size: usize,
    pub concurrency: usize,
    /// Server-side encryption mode, e.g. `AES256` or `aws:kms`. Empty disables it.
    pub sse: String,
    pub timeout_secs: u64,
    pub path_hostname_include: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            endpoint: String::new(),
            region: "us-east-1".to_string(),
            acl: "private".to_string(),
            force_path_style: false,
            path: String::new(),
            disable_ssl: false,
            disable_cert_verification: false,
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            sse: String::new(),
            timeout_secs: 300,
            path_hostname_include: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub credentials_file: String,
    pub credentials_json: String,
    pub bucket: String,
    pub path: String,
    pub part_size: usize,
    pub concurrency: usize,
    pub disable_cert_verification: bool,
    pub timeout_secs: u64,
    pub path_hostname_include: bool,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            credentials_file: String::new(),
            credentials_json: String::new(),
            bucket: String::new(),
            path: String::new(),
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            disable_cert_verification: false,
            timeout_secs: 300,
            path_hostname_include: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CosConfig {
    /// Bucket URL, e.g. `https://backups-1250000000.cos.ap-guangzhou.myqcloud.com`.
    pub url: String,
    pub secret_id: String,
    pub secret_key: String,
    pub path: String,
    pub part_size: usize,
    pub concurrency: usize,
    pub disable_cert_verification: bool,
    pub timeout_secs: u64,
    /// Log request and response headers of every COS call at debug level.
    pub debug: bool,
    pub path_hostname_include: bool,
}

impl Default for CosConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret_id: String::new(),
            secret_key: String::new(),
            path: String::new(),
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            disable_cert_verification: false,
            timeout_secs: 120,
            debug: false,
            path_hostname_include: false,
        }
    }
}

/// A directory on disk used as a bucket, e.g. an NFS mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub directory: String,
    pub path: String,
    pub timeout_secs: u64,
    pub path_hostname_include: bool,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
            path: String::new(),
            timeout_secs: 300,
            path_hostname_include: false,
        }
    }
}

impl Config {
    /// Parses a TOML document and validates the result.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Config = toml::from_str(document)
            .map_err(|e| Error::Validation(format!("cannot parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let document = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml_str(&document)
    }

    /// Loads `path`, or returns the defaults when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match Self::load(path.as_ref()) {
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.as_ref().display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Other(format!("cannot serialize configuration: {}", e)))
    }

    /// Semantic checks that parsing alone cannot express.
    pub fn validate(&self) -> Result<()> {
        validate_listen_addr(&self.api.listen_addr)?;

        match self.general.remote_storage {
            RemoteStorageKind::None => {}
            RemoteStorageKind::S3 => {
                let s3 = &self.s3;
                require(!s3.bucket.is_empty(), "s3.bucket must be set")?;
                require(
                    s3.part_size >= MIN_PART_SIZE,
                    &format!("s3.part_size must be at least {} bytes", MIN_PART_SIZE),
                )?;
                require(s3.concurrency >= 1, "s3.concurrency must be at least 1")?;
                require(s3.timeout_secs > 0, "s3.timeout_secs must be positive")?;
                // A bare `host:port` endpoint gets its scheme from `disable_ssl`.
                if !s3.endpoint.is_empty() && s3.endpoint.contains("://") {
                    validate_url("s3.endpoint", &s3.endpoint)?;
                }
            }
            RemoteStorageKind::Gcs => {
                let gcs = &self.gcs;
                require(!gcs.bucket.is_empty(), "gcs.bucket must be set")?;
                require(
                    gcs.part_size >= MIN_PART_SIZE,
                    &format!("gcs.part_size must be at least {} bytes", MIN_PART_SIZE),
                )?;
                require(gcs.concurrency >= 1, "gcs.concurrency must be at least 1")?;
                require(gcs.timeout_secs > 0, "gcs.timeout_secs must be positive")?;
            }
            RemoteStorageKind::Cos => {
                let cos = &self.cos;
                require(!cos.url.is_empty(), "cos.url must be set")?;
                validate_url("cos.url", &cos.url)?;
                require(
                    cos.part_size >= MIN_PART_SIZE,
                    &format!("cos.part_size must be at least {} bytes", MIN_PART_SIZE),
                )?;
                require(cos.concurrency >= 1, "cos.concurrency must be at least 1")?;
                require(cos.timeout_secs > 0, "cos.timeout_secs must be positive")?;
            }
            RemoteStorageKind::Local => {
                require(!self.local.directory.is_empty(), "local.directory must be set")?;
                require(self.local.timeout_secs > 0, "local.timeout_secs must be positive")?;
            }
        }

        Ok(())
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Validation(message.to_string()))
    }
}

fn validate_listen_addr(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Validation(format!("api.listen_addr {:?} must be host:port", addr)))?;
    require(!host.is_empty(), "api.listen_addr must include a host")?;
    port.parse::<u16>()
        .map_err(|_| Error::Validation(format!("api.listen_addr {:?} has an invalid port", addr)))?;
    Ok(())
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| Error::Validation(format!("{} {:?} is not a URL: {}", field, value, e)))?;
    require(
        matches!(parsed.scheme(), "http" | "https"),
        &format!("{} must use http or https", field),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.general.remote_storage, RemoteStorageKind::None);
        assert_eq!(config.s3.concurrency, 10);
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = Config::from_toml_str(
            r#"
            [general]
            remote_storage = "s3"

            [s3]
            bucket = "backups"
            path = "cluster-1"
            "#,
        )
        .unwrap();
        assert_eq!(config.general.remote_storage, RemoteStorageKind::S3);
        assert_eq!(config.s3.bucket, "backups");
        assert_eq!(config.s3.region, "us-east-1");
        assert_eq!(config.api.listen_addr, "localhost:7171");
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = Config::default();
        config.general.remote_storage = RemoteStorageKind::Cos;
        config.cos.url = "https://b-125.cos.ap-guangzhou.myqcloud.com".to_string();
        let dumped = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&dumped).unwrap(), config);
    }

    #[test]
    fn test_rejects_unknown_storage() {
        let err = Config::from_toml_str("[general]\nremote_storage = \"ftp\"\n").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_missing_bucket() {
        let err = Config::from_toml_str("[general]\nremote_storage = \"gcs\"\n").unwrap_err();
        assert!(err.to_string().contains("gcs.bucket"));
    }

    #[test]
    fn test_rejects_small_part_size() {
        let err = Config::from_toml_str(
            "[general]\nremote_storage = \"s3\"\n[s3]\nbucket = \"b\"\npart_size = 1024\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("part_size"));
    }

    #[test]
    fn test_rejects_small_gcs_part_size() {
        let err = Config::from_toml_str(
            "[general]\nremote_storage = \"gcs\"\n[gcs]\nbucket = \"b\"\npart_size = 1024\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("gcs.part_size"));

        let doc = format!(
            "[general]\nremote_storage = \"gcs\"\n[gcs]\nbucket = \"b\"\npart_size = {}\n",
            MIN_PART_SIZE
        );
        assert_eq!(Config::from_toml_str(&doc).unwrap().gcs.part_size, MIN_PART_SIZE);
    }

    #[test]
    fn test_rejects_bad_listen_addr() {
        for addr in ["7171", ":7171", "localhost:port", "localhost:70000"] {
            let doc = format!("[api]\nlisten_addr = \"{}\"\n", addr);
            assert!(
                matches!(Config::from_toml_str(&doc), Err(Error::Validation(_))),
                "{} accepted",
                addr
            );
        }
    }

    #[test]
    fn test_rejects_bad_cos_url() {
        let err = Config::from_toml_str(
            "[general]\nremote_storage = \"cos\"\n[cos]\nurl = \"ftp://bucket\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("cos.url"));
    }

    #[test]
    fn test_backups_dir_defaults_under_data_path() {
        let mut general = GeneralConfig::default();
        assert_eq!(general.backups_dir(), PathBuf::from("/var/lib/clickhouse/backup"));
        general.backups_path = "/srv/backups".to_string();
        assert_eq!(general.backups_dir(), PathBuf::from("/srv/backups"));
        assert_eq!(general.shadow_dir(), PathBuf::from("/var/lib/clickhouse/shadow"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
