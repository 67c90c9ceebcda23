//! Connection profile storage
//!
//! Keeps the single connection profile as JSON in ~/.toyvpn/connection.json.
//! The daemon socket lives in the same directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toyvpn_proto::{ConnectionConfig, ProtoError};

const CONFIG_FILE: &str = "connection.json";
const SOCKET_FILE: &str = "daemon.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to get home directory")]
    NoHomeDir,

    #[error("No connection configured (expected {0:?}); run `toyvpn config set` first")]
    NotConfigured(PathBuf),

    #[error("Failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid connection profile: {0}")]
    Invalid(#[from] ProtoError),
}

/// Directory holding the connection profile
#[derive(Debug, Clone)]
pub struct ConfigStore {
    base_dir: PathBuf,
}

impl ConfigStore {
    /// Store under ~/.toyvpn
    pub fn new() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(Self::with_base_dir(home.join(".toyvpn")))
    }

    /// Store under a custom directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.base_dir.join(SOCKET_FILE)
    }

    pub fn exists(&self) -> bool {
        self.config_path().exists()
    }

    /// Load and validate the stored profile
    pub fn load(&self) -> Result<ConnectionConfig, ConfigError> {
        let path = self.config_path();
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotConfigured(path))
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        let config: ConnectionConfig =
            serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate and write the profile, replacing any previous one
    pub fn save(&self, config: &ConnectionConfig) -> Result<(), ConfigError> {
        config.validate()?;

        fs::create_dir_all(&self.base_dir).map_err(|source| ConfigError::Io {
            path: self.base_dir.clone(),
            source,
        })?;

        let path = self.config_path();
        let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| ConfigError::Io { path, source })
    }

    /// Remove the stored profile; a missing profile is not an error
    pub fn clear(&self) -> Result<(), ConfigError> {
        let path = self.config_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }
}
