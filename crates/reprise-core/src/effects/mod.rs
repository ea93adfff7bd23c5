use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::clip::ClipRange;
use crate::models::looping::Looping;

/// A data source after resolution: something the pipeline can open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Local(PathBuf),
    Remote(String),
}

impl std::fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedSource::Local(path) => write!(f, "{}", path.display()),
            ResolvedSource::Remote(uri) => f.write_str(uri),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub source: ResolvedSource,
    pub clip: ClipRange,
    pub looping: Looping,
    /// Audio queued before the backend reports `Ready`.
    pub buffer_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Nothing prepared, or stopped.
    Idle,
    Buffering,
    Ready,
    /// Every loop played out.
    Ended,
    Error(String),
}

/// Trait for audio output backends, one instance per player.
///
/// All methods take `&self`; backends manage their own concurrency.
/// Offsets and positions are relative to the clip start.
pub trait AudioBackend: Send + Sync {
    fn prepare(&self, request: &PlaybackRequest);
    fn set_play_when_ready(&self, play: bool);
    fn play_when_ready(&self) -> bool;
    fn stop(&self);
    fn seek(&self, offset_ms: u64);
    fn set_volume(&self, volume: f32);
    fn set_speed(&self, speed: f32);
    fn set_looping(&self, looping: Looping);
    fn status(&self) -> PlaybackStatus;
    fn position_ms(&self) -> u64;
    fn buffered_ms(&self) -> u64;
    /// Length of the playable window, once known.
    fn duration_ms(&self) -> Option<u64>;
}

/// Builds one backend per player.
pub type BackendFactory = Arc<dyn Fn() -> Arc<dyn AudioBackend> + Send + Sync>;

/// Backend for headless hosts: accepts every command, produces no sound.
///
/// Reports `Ready` once prepared so players still initialize and emit
/// state events.
#[derive(Default)]
pub struct NoopBackend {
    prepared: AtomicBool,
    play_when_ready: AtomicBool,
    position_ms: AtomicU64,
}

impl AudioBackend for NoopBackend {
    fn prepare(&self, _: &PlaybackRequest) {
        self.prepared.store(true, Ordering::SeqCst);
        self.position_ms.store(0, Ordering::SeqCst);
    }
    fn set_play_when_ready(&self, play: bool) {
        self.play_when_ready.store(play, Ordering::SeqCst);
    }
    fn play_when_ready(&self) -> bool {
        self.play_when_ready.load(Ordering::SeqCst)
    }
    fn stop(&self) {
        self.prepared.store(false, Ordering::SeqCst);
    }
    fn seek(&self, offset_ms: u64) {
        self.position_ms.store(offset_ms, Ordering::SeqCst);
    }
    fn set_volume(&self, _: f32) {}
    fn set_speed(&self, _: f32) {}
    fn set_looping(&self, _: Looping) {}
    fn status(&self) -> PlaybackStatus {
        if self.prepared.load(Ordering::SeqCst) {
            PlaybackStatus::Ready
        } else {
            PlaybackStatus::Idle
        }
    }
    fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::SeqCst)
    }
    fn buffered_ms(&self) -> u64 {
        0
    }
    fn duration_ms(&self) -> Option<u64> {
        None
    }
}

#[cfg(feature = "native")]
pub mod audio;
#[cfg(feature = "http")]
pub mod http;
pub mod notify;
pub mod probe;
