//! Runtime configuration.
//!
//! A small JSON file at a fixed relative path. A missing or corrupt file
//! never fails startup: the hardcoded defaults below take over and a
//! warning is logged.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "frigorec.json";

const DEFAULT_HOST: &str = "192.168.0.214";
const DEFAULT_PORT: u16 = 55555;
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub transmitter_host: String,
    pub transmitter_port: u16,
    pub connection_timeout_ms: u64,
    pub database_path: PathBuf,
    pub export_output_path: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transmitter_host: DEFAULT_HOST.to_string(),
            transmitter_port: DEFAULT_PORT,
            connection_timeout_ms: DEFAULT_TIMEOUT_MS,
            database_path: PathBuf::from("frigorec.db"),
            export_output_path: PathBuf::from("export"),
        }
    }
}

impl RuntimeConfig {
    /// Loads the config file, falling back to defaults on any failure.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!(path = %path.display(), %err, "corrupt config file, using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(path = %path.display(), %err, "config file unreadable, using defaults");
                Self::default()
            }
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}
