//! Background downloads: a single-task queue persisted as scrolls, and the
//! per-URI tracker players read from.

pub mod manager;
pub mod tracker;

pub use manager::{DownloadListener, DownloadManager, FetchResponse, Fetcher};
pub use tracker::{DownloadTracker, ListenerId, TrackerListener};

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
