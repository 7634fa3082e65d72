//! Application configuration assembled from a JSON file and the command line.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gapsync_source::{HttpSourceConfig, RetryConfig};
use gapsync_sync::SyncConfig;

/// Everything the binary needs to build an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sync: SyncConfig,
    pub source: HttpSourceConfig,
    /// Attempts per catalog call, including the first.
    pub retry_attempts: u32,
    /// Minimum pause between catalog calls, in milliseconds.
    pub pacing_ms: u64,
    /// Progress state file. Defaults to the user data directory.
    pub state_file: Option<PathBuf>,
    /// SQLite document database. Defaults to the user data directory.
    pub database: Option<PathBuf>,
    /// Log level used when neither `RUST_LOG` nor `--verbose` is given.
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            source: HttpSourceConfig::default(),
            retry_attempts: 3,
            pacing_ms: 1_000,
            state_file: None,
            database: None,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Read a JSON configuration file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load from `path` if given, else use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new(self.retry_attempts)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    /// Resolved progress state path under `base` unless configured.
    pub fn state_path(&self, base: &Path) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| base.join("progress.json"))
    }

    /// Resolved database path under `base` unless configured.
    pub fn database_path(&self, base: &Path) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| base.join("documents.db"))
    }
}

/// Default directory for state and database files.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gapsync")
}
