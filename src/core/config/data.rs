use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Tunables of the session engine, read from `config.toml`.
///
/// Every field is optional in the file; missing ones take the defaults below.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    /// How long events for a turn are buffered before one timeline update.
    pub flush_interval_ms: u64,
    /// Buffered events that force an early flush.
    pub queue_capacity: usize,
    /// Silence after which an open stream counts as failed.
    pub idle_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub file_refresh_debounce_ms: u64,
    pub history_limit: usize,
    pub message_page_size: usize,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            flush_interval_ms: 200,
            queue_capacity: 256,
            idle_timeout_secs: 60,
            keepalive_interval_secs: 60,
            file_refresh_debounce_ms: 1000,
            history_limit: 20,
            message_page_size: 20,
            debug: false,
        }
    }
}

impl EngineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn file_refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.file_refresh_debounce_ms)
    }
}

pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
