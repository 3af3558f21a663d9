use crate::error::ConfigError;
use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "comunal";
pub const APP_NAME: &str = "registro";

pub const DATA_DIR_ENV: &str = "COMUNAL_DATA_DIR";
pub const CONFIG_FILE: &str = "comunal.json";
pub const BACKUP_DIR: &str = "backups";
pub const AUDIT_FILE: &str = "auditoria.json";

pub fn data_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().to_path_buf())
}
