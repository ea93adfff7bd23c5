//! Engine settings.
//!
//! Read once from the scroll at `/reprise/settings/engine` when the engine
//! boots. Missing fields take defaults; malformed data falls back to the
//! defaults entirely.

use std::path::PathBuf;

use nine_s_shell::Shell;
use serde::{Deserialize, Serialize};

use crate::paths;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where downloaded audio lives. Never evicted, only cleared.
    pub cache_dir: PathBuf,
    /// Directory containing the host's `flutter_assets`.
    pub asset_root: PathBuf,
    /// Heartbeat period; player state transitions are observed at this rate.
    pub tick_ms: u64,
    /// Period of `downloadState` refreshes while a download runs.
    pub progress_interval_ms: u64,
    /// Audio that must be queued before a player reports ready.
    pub buffer_ms: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_data_root().join("audio_downloads"),
            asset_root: PathBuf::from("."),
            tick_ms: 50,
            progress_interval_ms: 1000,
            buffer_ms: 250,
            request_timeout_secs: 15,
            max_retries: 5,
            user_agent: format!("reprise/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    /// Load from the settings scroll, falling back to defaults.
    pub fn load(shell: &Shell) -> Self {
        match shell.get(paths::SETTINGS_ENGINE) {
            Ok(Some(scroll)) => match serde_json::from_value::<EngineConfig>(scroll.data) {
                Ok(config) => config.sanitized(),
                Err(e) => {
                    log::warn!("reprise: invalid engine settings ({}), using defaults", e);
                    Self::default()
                }
            },
            Ok(None) => Self::default(),
            Err(e) => {
                log::warn!("reprise: failed to read engine settings: {}", e);
                Self::default()
            }
        }
    }

    /// Heartbeat ticks between two download progress refreshes.
    pub fn progress_every_ticks(&self) -> u64 {
        (self.progress_interval_ms / self.tick_ms).max(1)
    }

    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if self.tick_ms == 0 {
            self.tick_ms = defaults.tick_ms;
        }
        if self.progress_interval_ms == 0 {
            self.progress_interval_ms = defaults.progress_interval_ms;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = defaults.request_timeout_secs;
        }
        self
    }
}

/// `NINE_S_ROOT` when set, else `~/.reprise`.
fn default_data_root() -> PathBuf {
    if let Ok(root) = std::env::var("NINE_S_ROOT") {
        return PathBuf::from(root);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".reprise")
}
