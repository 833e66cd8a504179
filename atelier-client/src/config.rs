//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use atelier_collab::storage::DEFAULT_TRIM_SIZE;
use atelier_collab::{ProviderConfig, OUTDATED_TIMEOUT};

pub const ENV_API_URL: &str = "ATELIER_API_URL";
pub const ENV_MIRROR_PATH: &str = "ATELIER_MIRROR_PATH";
pub const ENV_RESYNC_MS: &str = "ATELIER_RESYNC_MS";
pub const ENV_SAVE_DEBOUNCE_MS: &str = "ATELIER_SAVE_DEBOUNCE_MS";
pub const ENV_API_TOKEN: &str = "ATELIER_API_TOKEN";

/// Tuning for one canvas session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Step-1 re-broadcast period while connected.
    pub resync_interval: Duration,
    /// Quiet period after the last camera change before the viewport is saved.
    pub viewport_save_debounce: Duration,
    pub awareness_timeout: Duration,
    /// Mirror log length that triggers compaction.
    pub mirror_trim_size: usize,
    pub offline_queue_capacity: usize,
    /// Alignment snap distance in screen pixels.
    pub snap_threshold_px: f64,
    /// World units around the content when fitting to screen.
    pub fit_padding: f64,
    /// RocksDB directory for the offline mirror; `None` keeps it in memory.
    pub mirror_path: Option<PathBuf>,
    pub api_base_url: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(5),
            viewport_save_debounce: Duration::from_millis(500),
            awareness_timeout: OUTDATED_TIMEOUT,
            mirror_trim_size: DEFAULT_TRIM_SIZE,
            offline_queue_capacity: 10_000,
            snap_threshold_px: 5.0,
            fit_padding: 100.0,
            mirror_path: None,
            api_base_url: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with the `ATELIER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Overlay values looked up by variable name. Malformed numbers are
    /// logged and ignored.
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.is_empty()) {
            self.api_base_url = Some(url);
        }
        if let Some(path) = lookup(ENV_MIRROR_PATH).filter(|v| !v.is_empty()) {
            self.mirror_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = millis(&lookup, ENV_RESYNC_MS) {
            self.resync_interval = ms;
        }
        if let Some(ms) = millis(&lookup, ENV_SAVE_DEBOUNCE_MS) {
            self.viewport_save_debounce = ms;
        }
        self
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            resync_interval: self.resync_interval,
            awareness_timeout: self.awareness_timeout,
            offline_queue_capacity: self.offline_queue_capacity,
        }
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            log::warn!("Ignoring {key}={raw:?}: expected a positive number of milliseconds");
            None
        }
    }
}
