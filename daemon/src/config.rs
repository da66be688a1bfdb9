use std::path::{Path, PathBuf};

use clap::Parser;
use ghostline_core::{AgentConfig, Gates, OracleConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const API_KEY_ENV: &str = "GHOSTLINE_API_KEY";

/// Ghostline daemon - shell sessions with inline suggestions and an agent
#[derive(Parser, Debug)]
#[command(name = "ghostline-daemon")]
pub struct Args {
    /// Bind address
    #[arg(long, default_value = "127.0.0.1:4790")]
    pub listen: String,

    /// Auth token (or set GHOSTLINE_DAEMON_TOKEN env var)
    #[arg(long, env = "GHOSTLINE_DAEMON_TOKEN")]
    pub token: Option<String>,

    /// Config file
    #[arg(long, env = "GHOSTLINE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable auth (dev only)
    #[arg(long)]
    pub insecure_no_auth: bool,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    pub fn require_auth(&self) -> bool {
        !self.insecure_no_auth
    }
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ghostline")
        .join("config.toml")
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to encode config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// config.toml format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub settings: Gates,
    pub oracle: OracleConfig,
    pub session: SessionConfig,
    pub agent: AgentConfig,
}

impl FileConfig {
    /// Reads the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FileConfig = toml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.cols == 0 || self.session.rows == 0 {
            return Err(ConfigError::Validation(
                "session.cols and session.rows must be positive".to_string(),
            ));
        }
        if self.session.execute_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "session.execute_timeout_secs must be positive".to_string(),
            ));
        }
        if self.agent.max_steps == 0 || self.agent.max_oracle_failures == 0 {
            return Err(ConfigError::Validation(
                "agent.max_steps and agent.max_oracle_failures must be positive".to_string(),
            ));
        }
        if self.oracle.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("oracle.base_url must be set".to_string()));
        }
        Ok(())
    }

    /// Oracle settings with the API key taken from the environment when the
    /// file leaves it empty.
    pub fn resolved_oracle(&self) -> OracleConfig {
        self.resolved_oracle_with(std::env::var(API_KEY_ENV).ok())
    }

    fn resolved_oracle_with(&self, env_key: Option<String>) -> OracleConfig {
        let mut oracle = self.oracle.clone();
        if oracle.api_key.is_empty() {
            if let Some(key) = env_key {
                oracle.api_key = key;
            }
        }
        oracle
    }
}
