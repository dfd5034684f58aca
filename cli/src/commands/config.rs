use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tablesnap_core::config::DEFAULT_CONFIG_PATH;
use tablesnap_core::Config;
use tracing::debug;

/// A loaded configuration and the file it came from, if any.
pub struct LoadedConfig {
    pub config: Config,
    pub path: Option<PathBuf>,
}

pub struct ConfigCommand;

impl ConfigCommand {
    pub fn print_default() -> Result<()> {
        print!("{}", Config::default().to_toml_string()?);
        Ok(())
    }

    pub fn print_effective(cli: &crate::Cli) -> Result<()> {
        let loaded = load(cli.config.as_deref())?;
        print!("{}", loaded.config.to_toml_string()?);
        Ok(())
    }
}

/// An explicit path must exist; the default path may be absent, in which
/// case the built-in defaults apply.
pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig> {
    match explicit {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            Ok(LoadedConfig {
                config,
                path: Some(path.to_path_buf()),
            })
        }
        None => {
            let path = Path::new(DEFAULT_CONFIG_PATH);
            let exists = path.is_file();
            let config = Config::load_or_default(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
            debug!(path = %path.display(), exists, "Resolved default configuration");
            Ok(LoadedConfig {
                config,
                path: exists.then(|| path.to_path_buf()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = TempDir::new().unwrap();
        assert!(load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_explicit_path_is_kept_for_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[api]\nlisten_addr = \"0.0.0.0:7171\"\n").unwrap();

        let loaded = load(Some(&path)).unwrap();
        assert_eq!(loaded.config.api.listen_addr, "0.0.0.0:7171");
        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[general]\nremote_storage = \"s3\"\n").unwrap();
        let err = load(Some(&path)).err().unwrap();
        assert!(format!("{:#}", err).contains("s3.bucket"));
    }
}
