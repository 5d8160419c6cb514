//! Server configuration loading and saving.
//!
//! Sources are layered, later ones winning:
//!
//! 1. built-in defaults
//! 2. a TOML file (`TAGWATCH_CONFIG`, else the platform default path)
//! 3. `TAGWATCH__*` environment variables, `__` separating nested keys
//!    (e.g. `TAGWATCH__ENGINE__SCAN__WINDOW_SECS=8`)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tagwatch_core::{EngineConfig, TagError};
use tracing::{debug, info};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "TAGWATCH_CONFIG";

const ENV_PREFIX: &str = "TAGWATCH";
const ENV_SEPARATOR: &str = "__";

/// Everything the server binary needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: String,

    /// Production logging (JSON files plus compact stdout).
    pub production: bool,

    /// Where claimed tags are stored. Platform default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Where production logs are written. Platform default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Remote verification endpoint. Verification is off when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_url: Option<String>,

    /// Engine settings.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            production: false,
            data_dir: None,
            log_dir: None,
            verify_url: None,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path` (if it exists) and the environment.
    ///
    /// # Errors
    ///
    /// Returns a parse error for malformed sources and a validation error
    /// when the merged engine settings are invalid.
    pub fn load(path: &Path) -> Result<Self, TagError> {
        debug!(path = %path.display(), "Loading configuration");
        let merged = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| TagError::ConfigParseError(e.to_string()))?;

        let loaded: Self = merged
            .try_deserialize()
            .map_err(|e| TagError::ConfigParseError(e.to_string()))?;
        loaded.engine.validate()?;
        Ok(loaded)
    }

    /// Write as TOML, creating the parent directory.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<(), TagError> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| TagError::PersistenceError(format!("Failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Resolved data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no platform default exists.
    pub fn data_dir(&self) -> Result<PathBuf, TagError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(tagwatch_core::default_data_dir()?),
        }
    }

    /// Resolved log directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(default_log_dir)
    }
}

fn default_log_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/tagwatch")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "tagwatch")
            .map(|dirs| dirs.data_local_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

/// The config file to use: `TAGWATCH_CONFIG`, else the platform default.
#[must_use]
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV).map_or_else(default_config_path, PathBuf::from)
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/tagwatch/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "tagwatch")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }
}
