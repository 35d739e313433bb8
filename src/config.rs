use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::storage::lock::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/relay.json";

/// Accepted range for `max_line_bytes`.
pub const MIN_LINE_BYTES: u64 = 1023;
pub const MAX_LINE_BYTES: u64 = i32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Newline-delimited JSON log plus identity map file
    File,
    /// SQLite database
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_path: PathBuf,
    pub identity_path: PathBuf,
    pub backend: BackendKind,
    pub database_path: PathBuf,
    pub max_line_bytes: u64,
    pub poll_interval_ms: u64,
    pub lock_attempts: u32,
    pub lock_retry_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("data/chat_log.jsonl"),
            identity_path: PathBuf::from("data/identities.json"),
            backend: BackendKind::File,
            database_path: PathBuf::from("data/chat.db"),
            max_line_bytes: 8192,
            poll_interval_ms: 200,
            lock_attempts: 5,
            lock_retry_delay_ms: 20,
        }
    }
}

impl AppConfig {
    /// Pulls out-of-range values back into bounds, with a warning.
    pub fn clamped(mut self) -> Self {
        let bounded = self.max_line_bytes.clamp(MIN_LINE_BYTES, MAX_LINE_BYTES);
        if bounded != self.max_line_bytes {
            log::warn!(
                "max_line_bytes {} outside [{MIN_LINE_BYTES}, {MAX_LINE_BYTES}]; using {bounded}",
                self.max_line_bytes
            );
            self.max_line_bytes = bounded;
        }
        if self.poll_interval_ms == 0 {
            log::warn!("poll_interval_ms must be positive; using 1");
            self.poll_interval_ms = 1;
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.lock_attempts,
            Duration::from_millis(self.lock_retry_delay_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_line_len(&self) -> usize {
        usize::try_from(self.max_line_bytes).unwrap_or(usize::MAX)
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}
