//! Download tracker: an in-memory view of download status keyed by URI.
//!
//! Loaded from the download index once, then kept current by download
//! manager callbacks. Players read it to pick a data source and to report
//! download state; they subscribe to learn when it changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::manager::DownloadListener;
use crate::models::download::{Download, DownloadRequest, DownloadState};

/// Change callback. Carries no payload; listeners re-query the tracker.
pub type TrackerListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct DownloadTracker {
    downloads: RwLock<HashMap<String, Download>>,
    /// Copy-on-write so a listener may (un)subscribe while being notified.
    listeners: Mutex<Arc<Vec<(ListenerId, TrackerListener)>>>,
    next_listener: AtomicU64,
}

impl DownloadTracker {
    pub fn new(initial: impl IntoIterator<Item = Download>) -> Self {
        let downloads = initial
            .into_iter()
            .map(|d| (d.request.uri.clone(), d))
            .collect();
        Self {
            downloads: RwLock::new(downloads),
            listeners: Mutex::new(Arc::new(Vec::new())),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, listener: TrackerListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        let mut guard = self.listeners.lock();
        let mut next = Vec::clone(&guard);
        next.push((id, listener));
        *guard = Arc::new(next);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        let mut guard = self.listeners.lock();
        if guard.iter().any(|(lid, _)| *lid == id) {
            let next: Vec<_> = guard.iter().filter(|(lid, _)| *lid != id).cloned().collect();
            *guard = Arc::new(next);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn download(&self, uri: &str) -> Option<Download> {
        self.downloads.read().get(uri).cloned()
    }

    /// Known and not failed. A queued or running download counts.
    pub fn is_downloaded(&self, uri: &str) -> bool {
        self.downloads
            .read()
            .get(uri)
            .map(|d| d.state != DownloadState::Failed)
            .unwrap_or(false)
    }

    /// Unknown URIs read as `Queued`.
    pub fn download_state(&self, uri: &str) -> DownloadState {
        self.downloads
            .read()
            .get(uri)
            .map(|d| d.state)
            .unwrap_or(DownloadState::Queued)
    }

    pub fn download_request(&self, uri: &str) -> Option<DownloadRequest> {
        self.downloads
            .read()
            .get(uri)
            .filter(|d| d.state != DownloadState::Failed)
            .map(|d| d.request.clone())
    }

    fn notify(&self) {
        let snapshot = Arc::clone(&self.listeners.lock());
        for (_, listener) in snapshot.iter() {
            listener();
        }
    }
}

impl DownloadListener for DownloadTracker {
    fn on_download_changed(&self, download: &Download) {
        self.downloads
            .write()
            .insert(download.request.uri.clone(), download.clone());
        self.notify();
    }

    fn on_download_removed(&self, download: &Download) {
        self.downloads.write().remove(&download.request.uri);
        self.notify();
    }
}
