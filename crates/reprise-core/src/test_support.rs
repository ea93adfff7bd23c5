//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nine_s_shell::Shell;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tempfile::TempDir;

use crate::download::{FetchResponse, Fetcher};
use crate::effects::{AudioBackend, PlaybackRequest, PlaybackStatus};
use crate::error::{PluginError, Result};
use crate::models::looping::Looping;

/// `NINE_S_ROOT` is process-global; tests that open a shell take this lock.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn temp_shell(app: &str) -> (TempDir, Arc<Shell>, MutexGuard<'static, ()>) {
    let guard = ENV_LOCK.lock();
    let dir = TempDir::new().expect("tempdir");
    std::env::set_var("NINE_S_ROOT", dir.path());
    let shell = Shell::open(app, &[]).expect("shell");
    (dir, Arc::new(shell), guard)
}

/// Poll `f` every 10ms until it holds or `timeout_ms` passes.
pub fn wait_until(timeout_ms: u64, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}

/// In-memory HTTP stand-in with range support, injectable failures and
/// throttled bodies.
pub struct MemoryFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: AtomicU32,
    /// Answer range requests with the whole body, like a server without
    /// range support (200 instead of 206).
    ignore_ranges: AtomicBool,
    chunk_delay_ms: Arc<AtomicU64>,
    attempts: AtomicU32,
    offsets: Mutex<Vec<u64>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self {
            bodies: Mutex::new(HashMap::new()),
            failures: AtomicU32::new(0),
            ignore_ranges: AtomicBool::new(false),
            chunk_delay_ms: Arc::new(AtomicU64::new(0)),
            attempts: AtomicU32::new(0),
            offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, uri: &str, body: Vec<u8>) {
        self.bodies.lock().insert(uri.to_string(), body);
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges.store(ignore, Ordering::SeqCst);
    }

    /// Delay before every 1 KiB chunk, applied to bodies already in flight.
    pub fn set_chunk_delay_ms(&self, ms: u64) {
        self.chunk_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Offsets of successful requests, in order.
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().clone()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, uri: &str, offset: u64) -> Result<FetchResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failures = self.failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.failures.store(failures - 1, Ordering::SeqCst);
            return Err(PluginError::Download("connection reset".into()));
        }
        let body = self
            .bodies
            .lock()
            .get(uri)
            .cloned()
            .ok_or_else(|| PluginError::Download(format!("404 for {}", uri)))?;
        self.offsets.lock().push(offset);

        let offset = if self.ignore_ranges.load(Ordering::SeqCst) { 0 } else { offset };
        let start = (offset as usize).min(body.len());
        let rest = body[start..].to_vec();
        Ok(FetchResponse {
            content_length: Some(rest.len() as u64),
            resumed: offset > 0,
            reader: Box::new(ThrottledReader {
                data: rest,
                pos: 0,
                delay_ms: Arc::clone(&self.chunk_delay_ms),
            }),
        })
    }
}

struct ThrottledReader {
    data: Vec<u8>,
    pos: usize,
    delay_ms: Arc<AtomicU64>,
}

impl Read for ThrottledReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let n = buf.len().min(1024).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Backend whose status is driven by the test.
pub struct ScriptedBackend {
    status: Mutex<PlaybackStatus>,
    play_when_ready: AtomicBool,
    prepares: AtomicU32,
    last_request: Mutex<Option<PlaybackRequest>>,
    last_seek: Mutex<Option<u64>>,
    position_ms: AtomicU64,
    buffered_ms: AtomicU64,
    duration_ms: Mutex<Option<u64>>,
    speed: Mutex<f32>,
    volume: Mutex<f32>,
    looping: Mutex<Option<Looping>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            status: Mutex::new(PlaybackStatus::Idle),
            play_when_ready: AtomicBool::new(false),
            prepares: AtomicU32::new(0),
            last_request: Mutex::new(None),
            last_seek: Mutex::new(None),
            position_ms: AtomicU64::new(0),
            buffered_ms: AtomicU64::new(0),
            duration_ms: Mutex::new(None),
            speed: Mutex::new(1.0),
            volume: Mutex::new(1.0),
            looping: Mutex::new(None),
        }
    }
}

impl ScriptedBackend {
    pub fn set_status(&self, status: PlaybackStatus) {
        *self.status.lock() = status;
    }

    pub fn set_buffered(&self, ms: u64) {
        self.buffered_ms.store(ms, Ordering::SeqCst);
    }

    pub fn set_duration(&self, ms: Option<u64>) {
        *self.duration_ms.lock() = ms;
    }

    pub fn prepares(&self) -> u32 {
        self.prepares.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<PlaybackRequest> {
        self.last_request.lock().clone()
    }

    pub fn last_seek(&self) -> Option<u64> {
        *self.last_seek.lock()
    }

    pub fn speed(&self) -> f32 {
        *self.speed.lock()
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    pub fn looping(&self) -> Option<Looping> {
        *self.looping.lock()
    }
}

impl AudioBackend for ScriptedBackend {
    fn prepare(&self, request: &PlaybackRequest) {
        self.prepares.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());
        self.set_status(PlaybackStatus::Buffering);
    }
    fn set_play_when_ready(&self, play: bool) {
        self.play_when_ready.store(play, Ordering::SeqCst);
    }
    fn play_when_ready(&self) -> bool {
        self.play_when_ready.load(Ordering::SeqCst)
    }
    fn stop(&self) {
        self.set_status(PlaybackStatus::Idle);
    }
    fn seek(&self, offset_ms: u64) {
        *self.last_seek.lock() = Some(offset_ms);
        self.position_ms.store(offset_ms, Ordering::SeqCst);
    }
    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }
    fn set_speed(&self, speed: f32) {
        *self.speed.lock() = speed;
    }
    fn set_looping(&self, looping: Looping) {
        *self.looping.lock() = Some(looping);
    }
    fn status(&self) -> PlaybackStatus {
        self.status.lock().clone()
    }
    fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::SeqCst)
    }
    fn buffered_ms(&self) -> u64 {
        self.buffered_ms.load(Ordering::SeqCst)
    }
    fn duration_ms(&self) -> Option<u64> {
        *self.duration_ms.lock()
    }
}
