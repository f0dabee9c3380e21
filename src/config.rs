use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::{
    ExecutorSettings, DEFAULT_MAX_BATCH_COST, DEFAULT_MAX_ITERATIONS, DEFAULT_POLL_INTERVAL_SECS,
};
use crate::{Error, Result};

/// File looked up in the current directory before the home directory.
pub const LOCAL_CONFIG_FILE: &str = "stagewise.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_batch_cost: u32,
    pub max_iterations: u32,
    /// Per collaborator call; unset means no limit.
    pub collaborator_timeout_secs: Option<u64>,
    pub poll_interval_secs: u64,
    pub verify_command: Option<String>,
    pub mutate_command: Option<String>,
    /// Where the CLI mirrors progress snapshots; `~` is expanded.
    pub progress_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_batch_cost: DEFAULT_MAX_BATCH_COST,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            collaborator_timeout_secs: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            verify_command: None,
            mutate_command: None,
            progress_file: None,
        }
    }
}

impl Config {
    pub fn stagewise_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".stagewise"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::stagewise_dir()?.join("config.toml"))
    }

    /// Load `./stagewise.toml`, else `~/.stagewise/config.toml`, else defaults.
    pub fn load() -> Result<Self> {
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            return Self::load_from(&local);
        }
        match Self::config_path() {
            Ok(path) if path.exists() => Self::load_from(&path),
            Ok(_) | Err(Error::NoHomeDir) => {
                tracing::debug!("config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Config::load");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_batch_cost = config.max_batch_cost,
            max_iterations = config.max_iterations,
            timeout = ?config.collaborator_timeout_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_cost == 0 {
            return Err(Error::Validation(
                "max_batch_cost must be greater than zero".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::Validation(
                "max_iterations must be greater than zero".to_string(),
            ));
        }
        if self.collaborator_timeout_secs == Some(0) {
            return Err(Error::Validation(
                "collaborator_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::Validation(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            max_iterations: self.max_iterations,
            collaborator_timeout: self.collaborator_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn progress_path(&self) -> Option<PathBuf> {
        self.progress_file.as_deref().map(expand_tilde)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
