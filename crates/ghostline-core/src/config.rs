use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::history::DEFAULT_HISTORY_CAPACITY;

/// How sessions are spawned and how their input engine behaves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executable; `$SHELL` (or a platform default) when unset.
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Working directory; the home directory when unset.
    pub cwd: Option<PathBuf>,
    pub history_capacity: usize,
    /// Seed each session's history from the user's shell history file.
    pub seed_history: bool,
    pub debounce_ms: u64,
    pub execute_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 80,
            rows: 24,
            cwd: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            seed_history: true,
            debounce_ms: 200,
            execute_timeout_secs: 60,
        }
    }
}

impl SessionConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.execute_timeout_secs)
    }

    pub fn shell_path(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            return "powershell.exe".to_string();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }

    pub fn working_dir(&self) -> Option<PathBuf> {
        self.cwd.clone().or_else(dirs::home_dir)
    }
}

/// Bounds on a single agent run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: u32,
    /// Consecutive planning-oracle failures tolerated before the run is abandoned.
    pub max_oracle_failures: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_oracle_failures: 3,
        }
    }
}
