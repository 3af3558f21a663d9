//! Store configuration.
//!
//! Every field has a default; an optional `comunal.json` in the data
//! directory overrides any subset of them.

use crate::crypto::KDF_ITERATIONS;
use crate::document::DocumentKind;
use crate::error::ConfigError;
use crate::paths::{self, AUDIT_FILE, BACKUP_DIR, CONFIG_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_READ_ATTEMPTS: u32 = 3;
pub const DEFAULT_READ_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_BACKUP_RETENTION: usize = 10;
pub const DEFAULT_AUDIT_CAP: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_file: Option<PathBuf>,
    /// File names of the documents covered by snapshots.
    pub documents: Vec<String>,
    pub kdf_iterations: u32,
    pub read_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub debounce_ms: u64,
    pub backup_retention: usize,
    pub audit_cap: usize,
    pub snapshot_on_close: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            backup_dir: None,
            audit_file: None,
            documents: DocumentKind::ALL
                .iter()
                .map(|kind| kind.file_name())
                .collect(),
            kdf_iterations: KDF_ITERATIONS,
            read_attempts: DEFAULT_READ_ATTEMPTS,
            read_retry_delay_ms: DEFAULT_READ_RETRY_DELAY_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            backup_retention: DEFAULT_BACKUP_RETENTION,
            audit_cap: DEFAULT_AUDIT_CAP,
            snapshot_on_close: true,
        }
    }
}

impl StoreConfig {
    pub fn for_data_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Resolve the data directory (explicit override, `COMUNAL_DATA_DIR`, then
    /// the platform data dir) and apply `comunal.json` when present.
    pub fn load(data_dir_override: Option<PathBuf>) -> Result<Self, ConfigError> {
        let dir = match data_dir_override {
            Some(dir) => dir,
            None => paths::data_dir()?,
        };
        Self::load_from_dir(&dir)
    }

    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::for_data_dir(dir));
        }
        let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config: StoreConfig =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = dir.to_path_buf();
        }
        Ok(config)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(BACKUP_DIR))
    }

    pub fn audit_path(&self) -> PathBuf {
        self.audit_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(AUDIT_FILE))
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_follow_data_dir() {
        let config = StoreConfig::for_data_dir("/srv/comunal");
        assert_eq!(config.backup_dir(), PathBuf::from("/srv/comunal/backups"));
        assert_eq!(
            config.audit_path(),
            PathBuf::from("/srv/comunal/auditoria.json")
        );
        assert_eq!(config.kdf_iterations, 100_000);
        assert_eq!(config.audit_cap, 10_000);
        assert_eq!(config.documents.len(), 4);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"debounce_ms": 50, "backup_retention": 3}"#,
        )
        .unwrap();
        let config = StoreConfig::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.backup_retention, 3);
        assert_eq!(config.read_attempts, DEFAULT_READ_ATTEMPTS);
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        assert!(matches!(
            StoreConfig::load_from_dir(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
