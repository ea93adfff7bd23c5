//! reprise-core: clip-range audio players with looping, speed control and
//! download caching, over 9S scrolls.
//!
//! Hosts drive the engine with method calls and read per-player event
//! channels. Everything that must outlive the process (download index,
//! notifications, settings) is a scroll.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: 9S Substrate (settings, download index, event mirrors)
//! Layer 1: Effects (audio decode + output, HTTP, notifications)
//! Layer 2: Players + downloads (state machines over the effects)
//! Layer 3: Engine (method-call dispatch, event channels, heartbeat)
//! ```

pub mod config;
pub mod download;
pub mod effects;
pub mod engine;
pub mod error;
pub mod models;
pub mod paths;
pub mod player;
pub mod sink;
pub mod source;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{PluginError, Result};
pub use models::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_shell;
    use std::sync::Arc;

    #[test]
    fn settings_scroll_configures_engine() {
        let (dir, shell, _guard) = temp_shell("test-settings");
        let cache = dir.path().join("lesson-cache");
        shell
            .put(
                paths::SETTINGS_ENGINE,
                serde_json::json!({"cache_dir": cache, "buffer_ms": 500, "max_retries": 2}),
            )
            .unwrap();

        let shell = Arc::try_unwrap(shell).ok().expect("sole owner");
        let engine = Engine::new(shell);
        assert_eq!(engine.config().cache_dir, cache);
        assert_eq!(engine.config().buffer_ms, 500);
        assert_eq!(engine.config().tick_ms, 50);
        assert_eq!(engine.downloads().cache_dir(), cache.as_path());
        assert!(cache.is_dir());
    }

    #[test]
    fn malformed_settings_fall_back() {
        let (_dir, shell, _guard) = temp_shell("test-settings-invalid");
        shell
            .put(paths::SETTINGS_ENGINE, serde_json::json!({"tick_ms": "fast"}))
            .unwrap();
        assert_eq!(EngineConfig::load(&shell), EngineConfig::default());
    }

    #[test]
    fn download_index_survives_restart() {
        let (_dir, shell, _guard) = temp_shell("test-index");
        let uri = "https://cdn.example.com/a.mp3";
        {
            let shell = Arc::clone(&shell);
            let downloads = download::DownloadManager::new(
                shell,
                &EngineConfig::default(),
                Arc::new(download::manager::UnsupportedFetcher),
            );
            downloads
                .add_download(models::download::DownloadRequest::new(uri, "A"))
                .unwrap();
        }
        let id = models::download::download_id(uri);
        let scroll = shell.get(&paths::download_path(&id)).unwrap().unwrap();
        assert_eq!(scroll.data["request"]["uri"], uri);

        let reloaded = download::DownloadManager::new(
            shell,
            &EngineConfig::default(),
            Arc::new(download::manager::UnsupportedFetcher),
        );
        let download = reloaded.download(&id).unwrap();
        assert_eq!(download.state, models::download::DownloadState::Queued);
        assert_eq!(download.request.title(), "A");
    }
}
