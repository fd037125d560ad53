use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the config document inside the home directory.
pub const CONFIG_FILE_NAME: &str = ".gatorconfig.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("cannot locate config file: neither GATOR_CONFIG nor HOME is set")]
    NoHome,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub db_url: String,
    /// Name of the logged-in user, empty when nobody is logged in.
    #[serde(default)]
    pub current_user_name: String,
    /// Per-request fetch deadline in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Fail fetches with a non-success status instead of parsing the body anyway
    #[serde(default)]
    pub strict_http_status: bool,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

impl Config {
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            current_user_name: String::new(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            strict_http_status: false,
        }
    }

    /// Where the config lives: `$GATOR_CONFIG`, else `$HOME/.gatorconfig.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os("GATOR_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
        Ok(PathBuf::from(home).join(CONFIG_FILE_NAME))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse config from a JSON string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn current_user(&self) -> Option<&str> {
        match self.current_user_name.trim() {
            "" => None,
            name => Some(name),
        }
    }

    pub fn set_user(&mut self, name: &str) {
        self.current_user_name = name.to_string();
    }
}
