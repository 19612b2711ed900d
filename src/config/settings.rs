//! TOML-based configuration for the query engine.
//!
//! Example configuration:
//! ```toml
//! dialect = "postgres"
//!
//! [aliases]
//! length = 8
//!
//! [prefetch]
//! concurrent_siblings = true
//!
//! [pagination]
//! subquery = true
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::sql::Dialect;

/// Shortest alias length the registry will mint.
pub const MIN_ALIAS_LENGTH: usize = 4;
/// Longest alias length the registry will mint.
pub const MAX_ALIAS_LENGTH: usize = 16;

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// SQL dialect statements are compiled for.
    pub dialect: Dialect,

    /// Alias minting.
    pub aliases: AliasSettings,

    /// Prefetch execution.
    pub prefetch: PrefetchSettings,

    /// Pagination under joins.
    pub pagination: PaginationSettings,
}

/// Alias minting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AliasSettings {
    /// Number of hex characters in a minted alias.
    pub length: usize,
}

impl Default for AliasSettings {
    fn default() -> Self {
        Self { length: 6 }
    }
}

impl AliasSettings {
    /// Alias length clamped to the supported range.
    pub fn effective_length(&self) -> usize {
        self.length.clamp(MIN_ALIAS_LENGTH, MAX_ALIAS_LENGTH)
    }
}

/// Prefetch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrefetchSettings {
    /// Load sibling relations of the same parent concurrently.
    pub concurrent_siblings: bool,
}

impl Default for PrefetchSettings {
    fn default() -> Self {
        Self {
            concurrent_siblings: true,
        }
    }
}

/// Pagination configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PaginationSettings {
    /// Paginate the root through a derived table when joins are present.
    /// When false, a root-key semi-join is used instead.
    pub subquery: bool,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self { subquery: true }
    }
}

impl EngineSettings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: EngineSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `GRAFT_CONFIG`
    /// 2. `./graft.toml`
    /// 3. `~/.config/graft/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        // Check environment variable first
        if let Ok(path) = env::var("GRAFT_CONFIG") {
            return Self::from_file(&path);
        }

        // Check local directory
        let local_config = PathBuf::from("graft.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        // Check user config directory
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("graft").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        // Return defaults if no config file found
        Ok(EngineSettings::default())
    }

    /// Builder-style dialect override.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}
