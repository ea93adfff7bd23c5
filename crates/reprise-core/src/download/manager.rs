//! Download manager: one transfer at a time, FIFO.
//!
//! Every download has an index scroll at `/reprise/downloads/<id>` holding
//! its [`Download`] record; removal soft-deletes it. Bytes land in
//! `<cache_dir>/<id>.part` and are renamed into place once complete, so a
//! paused or interrupted transfer resumes from the partial file with a
//! range request.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nine_s_shell::Shell;
use parking_lot::{Condvar, Mutex, RwLock};

use super::now_ms;
use crate::config::EngineConfig;
use crate::error::{log_err, PluginError, Result};
use crate::models::download::{download_id, Download, DownloadRequest, DownloadState};
use crate::paths;
use crate::source::extension_from_url;

/// Receives every change the manager makes to a download.
pub trait DownloadListener: Send + Sync {
    fn on_download_changed(&self, download: &Download);
    fn on_download_removed(&self, download: &Download);
}

/// A response body to stream into the cache.
pub struct FetchResponse {
    /// Length of this body, not of the whole resource.
    pub content_length: Option<u64>,
    /// The server honoured the requested offset.
    pub resumed: bool,
    pub reader: Box<dyn Read + Send + Sync>,
}

/// Network seam. `offset > 0` asks for the bytes from `offset` on.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, uri: &str, offset: u64) -> Result<FetchResponse>;
}

/// Fetcher for builds without a network stack.
pub struct UnsupportedFetcher;

impl Fetcher for UnsupportedFetcher {
    fn fetch(&self, uri: &str, _offset: u64) -> Result<FetchResponse> {
        Err(PluginError::Download(format!("no network support compiled in for {}", uri)))
    }
}

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
const REMOVE_WAIT: Duration = Duration::from_secs(5);

// Cancel reasons carried by the active transfer's flag.
const RUNNING: u8 = 0;
const CANCEL_PAUSE: u8 = 1;
const CANCEL_REMOVE: u8 = 2;
const CANCEL_SHUTDOWN: u8 = 3;

struct ActiveTransfer {
    id: String,
    cancel: Arc<AtomicU8>,
}

enum TransferError {
    Cancelled(u8),
    Failed(String),
}

pub struct DownloadManager {
    shell: Arc<Shell>,
    cache_dir: PathBuf,
    max_retries: u32,
    fetcher: Arc<dyn Fetcher>,
    /// Authoritative records, mirrored to the index scrolls.
    downloads: Mutex<HashMap<String, Download>>,
    queue: Mutex<VecDeque<String>>,
    wake: Condvar,
    active: Mutex<Option<ActiveTransfer>>,
    idle: Condvar,
    paused: AtomicBool,
    shutdown: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn DownloadListener>>>,
}

impl DownloadManager {
    /// Load the download index from the shell. Nothing runs until `start`.
    pub fn new(shell: Arc<Shell>, config: &EngineConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let downloads = load_index(&shell);
        log_err(fs::create_dir_all(&config.cache_dir), "create download cache");

        Self {
            shell,
            cache_dir: config.cache_dir.clone(),
            max_retries: config.max_retries,
            fetcher,
            downloads: Mutex::new(downloads),
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            active: Mutex::new(None),
            idle: Condvar::new(),
            paused: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Re-queue unfinished downloads and spawn the worker.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let mut unfinished: Vec<Download> = self
            .downloads
            .lock()
            .values()
            .filter(|d| matches!(d.state, DownloadState::Queued | DownloadState::Downloading))
            .cloned()
            .collect();
        unfinished.sort_by_key(|d| d.start_time_ms);

        for download in &unfinished {
            if download.state == DownloadState::Downloading {
                self.update(&download.request.id, |d| d.state = DownloadState::Queued);
            }
            self.enqueue(&download.request.id);
        }
        if !unfinished.is_empty() {
            log::info!("reprise: resuming {} unfinished download(s)", unfinished.len());
        }

        let manager = Arc::clone(self);
        thread::spawn(move || manager.run())
    }

    /// Stop the worker. The active transfer keeps its partial file.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_active(None, CANCEL_SHUTDOWN);
        let _queue = self.queue.lock();
        self.wake.notify_all();
    }

    pub fn add_listener(&self, listener: Arc<dyn DownloadListener>) {
        self.listeners.write().push(listener);
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the finished download for `uri` lives (whether or not it exists).
    pub fn cached_file(&self, uri: &str) -> PathBuf {
        let id = download_id(uri);
        match extension_from_url(uri) {
            Some(ext) => self.cache_dir.join(format!("{}.{}", id, ext)),
            None => self.cache_dir.join(id),
        }
    }

    fn part_file(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.part", id))
    }

    pub fn download(&self, id: &str) -> Option<Download> {
        self.downloads.lock().get(id).cloned()
    }

    /// All downloads, oldest first.
    pub fn downloads(&self) -> Vec<Download> {
        let mut all: Vec<Download> = self.downloads.lock().values().cloned().collect();
        all.sort_by_key(|d| d.start_time_ms);
        all
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Queue a download. Completed, queued and running downloads are left
    /// alone; a failed one is queued again.
    pub fn add_download(&self, request: DownloadRequest) -> Result<()> {
        let id = request.id.clone();
        let download = {
            let mut downloads = self.downloads.lock();
            match downloads.get(&id).map(|d| d.state) {
                Some(DownloadState::Completed | DownloadState::Queued | DownloadState::Downloading) => {
                    return Ok(());
                }
                Some(DownloadState::Removing) => {
                    return Err(PluginError::Download(format!("download {} is being removed", id)));
                }
                Some(DownloadState::Failed) | None => {}
            }
            let download = Download::queued(request, now_ms());
            downloads.insert(id.clone(), download.clone());
            download
        };

        if let Err(e) = self.persist(&download) {
            self.downloads.lock().remove(&id);
            return Err(e);
        }
        log::info!("reprise: queued download {} ({})", id, download.request.uri);
        self.broadcast_changed(&download);
        self.enqueue(&id);
        Ok(())
    }

    /// Cancel, delete the cached bytes and drop the index entry.
    pub fn remove_download(&self, id: &str) -> Result<()> {
        let removing = {
            let mut downloads = self.downloads.lock();
            let Some(download) = downloads.get_mut(id) else {
                return Ok(());
            };
            download.state = DownloadState::Removing;
            download.update_time_ms = now_ms();
            download.clone()
        };
        log_err(self.persist(&removing), "persist download");
        self.broadcast_changed(&removing);

        self.queue.lock().retain(|queued| queued != id);
        self.cancel_active(Some(id), CANCEL_REMOVE);
        self.wait_until_inactive(id);

        self.delete_files(&removing.request);
        self.downloads.lock().remove(id);
        log_err(self.soft_delete(id), "delete download index");

        for listener in self.listeners.read().iter() {
            listener.on_download_removed(&removing);
        }
        log::info!("reprise: removed download {}", id);
        Ok(())
    }

    /// Stop transferring. The active download keeps its partial file and
    /// goes back to the head of the queue.
    pub fn pause_downloads(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancel_active(None, CANCEL_PAUSE);
        log::info!("reprise: downloads paused");
    }

    pub fn resume_downloads(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _queue = self.queue.lock();
        self.wake.notify_all();
        log::info!("reprise: downloads resumed");
    }

    /// Remove every download and wipe the cache directory.
    pub fn clear_cache(&self) -> Result<()> {
        let ids: Vec<String> = self.downloads.lock().keys().cloned().collect();
        for id in ids {
            self.remove_download(&id)?;
        }
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir)
                .map_err(|e| PluginError::Download(format!("clear cache: {}", e)))?;
        }
        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| PluginError::Download(format!("recreate cache: {}", e)))?;
        log::info!("reprise: download cache cleared");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    fn run(&self) {
        loop {
            let id = {
                let mut queue = self.queue.lock();
                loop {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    if !self.paused.load(Ordering::SeqCst) {
                        if let Some(id) = queue.pop_front() {
                            break id;
                        }
                    }
                    self.wake.wait(&mut queue);
                }
            };
            self.process(&id);
        }
    }

    fn process(&self, id: &str) {
        let cancel = Arc::new(AtomicU8::new(RUNNING));
        // Claim the transfer under the records lock: a removal either sees
        // it active and cancels it, or is seen here and wins.
        let request = {
            let downloads = self.downloads.lock();
            let request = match downloads.get(id) {
                Some(d) if matches!(d.state, DownloadState::Queued | DownloadState::Downloading) => {
                    d.request.clone()
                }
                _ => return,
            };
            *self.active.lock() = Some(ActiveTransfer {
                id: id.to_string(),
                cancel: Arc::clone(&cancel),
            });
            request
        };
        if self.paused.load(Ordering::SeqCst) {
            cancel.store(CANCEL_PAUSE, Ordering::SeqCst);
        }

        let mut attempt = 0;
        loop {
            self.update(id, |d| {
                d.state = DownloadState::Downloading;
                d.failure_reason = None;
            });

            match self.transfer(&request, &cancel) {
                Ok(bytes) => {
                    self.update(id, |d| {
                        d.state = DownloadState::Completed;
                        d.bytes_downloaded = bytes;
                        d.content_length = Some(d.content_length.unwrap_or(bytes));
                    });
                    log::info!("reprise: download {} completed ({} bytes)", id, bytes);
                    break;
                }
                Err(TransferError::Cancelled(reason)) => {
                    self.on_cancelled(id, reason);
                    break;
                }
                Err(TransferError::Failed(reason)) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        log::warn!("reprise: download {} failed: {}", id, reason);
                        self.update(id, |d| {
                            d.state = DownloadState::Failed;
                            d.failure_reason = Some(reason.clone());
                        });
                        break;
                    }
                    log::warn!(
                        "reprise: download {} attempt {} failed ({}), retrying",
                        id,
                        attempt,
                        reason
                    );
                    if let Some(reason) = self.backoff(attempt, &cancel) {
                        self.on_cancelled(id, reason);
                        break;
                    }
                }
            }
        }

        *self.active.lock() = None;
        self.idle.notify_all();
    }

    /// Stream one response into the partial file. Returns the final size.
    fn transfer(&self, request: &DownloadRequest, cancel: &AtomicU8) -> std::result::Result<u64, TransferError> {
        let id = request.id.as_str();
        let part = self.part_file(id);
        let target = self.cached_file(&request.uri);
        let offset = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);

        let response = self
            .fetcher
            .fetch(&request.uri, offset)
            .map_err(|e| TransferError::Failed(e.to_string()))?;

        let resumed = response.resumed && offset > 0;
        let file = if resumed {
            OpenOptions::new().append(true).open(&part)
        } else {
            File::create(&part)
        };
        let mut file = file.map_err(failed)?;
        let mut written = if resumed { offset } else { 0 };
        let total = response.content_length.map(|len| len + written);
        if resumed {
            log::info!("reprise: resuming download {} at byte {}", id, offset);
        }

        self.update(id, |d| {
            d.bytes_downloaded = written;
            d.content_length = total;
        });

        let mut reader = response.reader;
        let mut buf = vec![0u8; 64 * 1024];
        let mut last_progress = Instant::now();
        loop {
            let reason = cancel.load(Ordering::SeqCst);
            if reason != RUNNING {
                return Err(TransferError::Cancelled(reason));
            }
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(failed(e)),
            };
            file.write_all(&buf[..n]).map_err(failed)?;
            written += n as u64;

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                self.update(id, |d| d.bytes_downloaded = written);
                last_progress = Instant::now();
            }
        }
        file.flush().map_err(failed)?;
        drop(file);

        if let Some(total) = total {
            if written < total {
                return Err(TransferError::Failed(format!(
                    "connection closed after {} of {} bytes",
                    written, total
                )));
            }
        }
        let reason = cancel.load(Ordering::SeqCst);
        if reason != RUNNING {
            return Err(TransferError::Cancelled(reason));
        }
        fs::rename(&part, &target).map_err(failed)?;
        Ok(written)
    }

    /// Linear back-off; returns early with the cancel reason if cancelled.
    fn backoff(&self, attempt: u32, cancel: &AtomicU8) -> Option<u8> {
        let deadline = Instant::now() + RETRY_BACKOFF * attempt;
        while Instant::now() < deadline {
            let reason = cancel.load(Ordering::SeqCst);
            if reason != RUNNING {
                return Some(reason);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    fn on_cancelled(&self, id: &str, reason: u8) {
        match reason {
            CANCEL_PAUSE => {
                self.update(id, |d| d.state = DownloadState::Queued);
                let mut queue = self.queue.lock();
                if !queue.iter().any(|queued| queued == id) {
                    queue.push_front(id.to_string());
                }
            }
            CANCEL_SHUTDOWN => {
                self.update(id, |d| d.state = DownloadState::Queued);
            }
            // Removal cleans up after itself.
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn enqueue(&self, id: &str) {
        let mut queue = self.queue.lock();
        if !queue.iter().any(|queued| queued == id) {
            queue.push_back(id.to_string());
        }
        self.wake.notify_all();
    }

    fn cancel_active(&self, id: Option<&str>, reason: u8) {
        if let Some(active) = self.active.lock().as_ref() {
            if id.map_or(true, |id| active.id == id) {
                active.cancel.store(reason, Ordering::SeqCst);
            }
        }
    }

    fn wait_until_inactive(&self, id: &str) {
        let mut active = self.active.lock();
        while active.as_ref().map_or(false, |a| a.id == id) {
            if self.idle.wait_for(&mut active, REMOVE_WAIT).timed_out() {
                log::warn!("reprise: transfer {} did not stop in time", id);
                break;
            }
        }
    }

    /// Mutate a record, persist it and tell listeners. Records being removed
    /// are frozen.
    fn update(&self, id: &str, f: impl FnOnce(&mut Download)) -> Option<Download> {
        let updated = {
            let mut downloads = self.downloads.lock();
            let download = downloads.get_mut(id)?;
            if download.state == DownloadState::Removing {
                return None;
            }
            f(download);
            download.update_time_ms = now_ms();
            download.clone()
        };
        log_err(self.persist(&updated), "persist download");
        self.broadcast_changed(&updated);
        Some(updated)
    }

    fn broadcast_changed(&self, download: &Download) {
        for listener in self.listeners.read().iter() {
            listener.on_download_changed(download);
        }
    }

    fn persist(&self, download: &Download) -> Result<()> {
        let path = paths::download_path(&download.request.id);
        let data = serde_json::to_value(download)
            .map_err(|e| PluginError::Download(format!("serialize {}: {}", download.request.id, e)))?;
        // A soft-deleted entry comes back to life when re-added.
        match self.shell.get(&path)? {
            Some(mut scroll) if scroll.metadata.deleted == Some(true) => {
                scroll.data = data;
                scroll.metadata.deleted = None;
                self.shell.put_scroll(scroll)?;
            }
            _ => {
                self.shell.put(&path, data)?;
            }
        }
        Ok(())
    }

    fn soft_delete(&self, id: &str) -> Result<()> {
        let path = paths::download_path(id);
        if let Some(mut scroll) = self.shell.get(&path)? {
            scroll.metadata.deleted = Some(true);
            self.shell.put_scroll(scroll)?;
        }
        Ok(())
    }

    fn delete_files(&self, request: &DownloadRequest) {
        for path in [self.part_file(&request.id), self.cached_file(&request.uri)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("reprise: delete {} failed: {}", path.display(), e),
            }
        }
    }
}

fn failed(e: std::io::Error) -> TransferError {
    TransferError::Failed(e.to_string())
}

fn load_index(shell: &Shell) -> HashMap<String, Download> {
    let mut downloads = HashMap::new();
    let index = match shell.all(paths::DOWNLOADS_PREFIX) {
        Ok(index) => index,
        Err(e) => {
            log::warn!("reprise: read download index failed: {}", e);
            return downloads;
        }
    };
    for path in index {
        let Ok(Some(scroll)) = shell.get(&path) else {
            continue;
        };
        if scroll.metadata.deleted == Some(true) {
            continue;
        }
        match serde_json::from_value::<Download>(scroll.data) {
            // A removal interrupted by a crash is finished lazily: the entry
            // reads as failed so it can be re-added or removed again.
            Ok(mut download) => {
                if download.state == DownloadState::Removing {
                    download.state = DownloadState::Failed;
                    download.failure_reason = Some("removal interrupted".into());
                }
                downloads.insert(download.request.id.clone(), download);
            }
            Err(e) => log::warn!("reprise: skipping malformed download {}: {}", path, e),
        }
    }
    downloads
}
