//! Minimal configuration for the backup agent binary: a single TOML file
//! read once at startup. This stands in for the registration/credential
//! RPCs and `SectionConfig`-style parsing the core engine doesn't own.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

fn default_workers() -> usize {
    2
}

fn default_debounce_secs() -> u64 {
    5
}

/// Parsed form of the agent's TOML config file.
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub device_id: String,
    pub server_url: String,
    pub backup_roots: Vec<PathBuf>,
    pub cache_path: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
}

impl ClientConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        let config: ClientConfig = toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            bail!("device_id must not be empty");
        }
        if self.backup_roots.is_empty() {
            bail!("backup_roots must list at least one path");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        Ok(())
    }
}

/// Stands in for the out-of-scope credential-storage/registration RPCs:
/// enough identity and local state to construct the upload-set manager and
/// cache.
pub struct DeviceContext {
    pub device_id: String,
    pub server_url: String,
    pub backup_roots: Vec<PathBuf>,
    pub cache_path: PathBuf,
    pub workers: usize,
    pub debounce: std::time::Duration,
}

impl From<ClientConfig> for DeviceContext {
    fn from(config: ClientConfig) -> Self {
        Self {
            device_id: config.device_id,
            server_url: config.server_url,
            backup_roots: config.backup_roots,
            cache_path: config.cache_path,
            workers: config.workers,
            debounce: std::time::Duration::from_secs(config.debounce_secs),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_parses_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            device_id = "dev-1"
            server_url = "https://store.example"
            backup_roots = ["/home/alice"]
            cache_path = "/var/lib/backup-agent/cache.db"
            "#
        )
        .unwrap();
        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.device_id, "dev-1");
        assert_eq!(config.workers, 2);
        assert_eq!(config.debounce_secs, 5);
    }

    #[test]
    fn load_rejects_empty_backup_roots() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            device_id = "dev-1"
            server_url = "https://store.example"
            backup_roots = []
            cache_path = "/var/lib/backup-agent/cache.db"
            "#
        )
        .unwrap();
        assert!(ClientConfig::load(file.path()).is_err());
    }
}
