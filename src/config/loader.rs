//! Profile file loader.
//!
//! Loads TOML from a specific path or the default location. When the
//! default location has no file, the built-in defaults are used.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{config_path, GuiderConfig};

/// Failure to load the profile file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The explicitly requested file does not exist.
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },

    /// The file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is not valid TOML for the profile schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Stateless profile loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the profile from a specific path.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NotFound`] when the file does not exist,
    /// [`ConfigError::Read`] for other I/O failures,
    /// [`ConfigError::Parse`] for invalid TOML.
    pub fn load_from_path(path: &Path) -> Result<GuiderConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Loads the profile from the default location.
    ///
    /// A missing file is not an error; the defaults are returned instead.
    pub fn load_default() -> Result<GuiderConfig, ConfigError> {
        let path = config_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            tracing::debug!("no config file at {:?}, using defaults", path);
            Ok(GuiderConfig::default())
        }
    }
}
