//! One audio player: a backend, its event stream and its download state.
//!
//! Backend status is sampled by the engine heartbeat; transitions become
//! channel events. Every message is also mirrored to
//! `/reprise/players/<id>/event` so scroll watchers see the same stream.

use std::sync::{Arc, Weak};

use nine_s_shell::Shell;
use parking_lot::Mutex;
use serde_json::Value;

use crate::download::{DownloadManager, DownloadTracker, ListenerId};
use crate::effects::{AudioBackend, PlaybackRequest, PlaybackStatus};
use crate::error::{log_err, Result};
use crate::models::args::ArgsExt;
use crate::models::clip::ClipRange;
use crate::models::download::{ClientDownloadState, Download, DownloadRequest, DownloadState};
use crate::models::event::{PlayerEvent, SinkMessage};
use crate::models::looping::Looping;
use crate::paths;
use crate::sink::{EventDelegate, QueuingEventSink};
use crate::source::{DataSource, SourceResolver};

/// Everything `create` and `reset` configure.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    pub source: DataSource,
    pub clip: ClipRange,
    pub looping: Looping,
    pub auto_cache: bool,
}

impl PlayerOptions {
    pub fn from_args(args: &Value) -> Result<Self> {
        let source = DataSource::from_args(args)?;
        let clip = match args.i64_array("clipRange") {
            Some(values) => ClipRange::from_args(&values)?,
            None => ClipRange::FULL,
        };
        Ok(Self {
            source,
            clip,
            looping: Looping::from_times(args.i64_field("loopingTimes").unwrap_or(0)),
            auto_cache: args.bool_field("autoCache").unwrap_or(false),
        })
    }
}

/// Services shared by every player of an engine.
pub struct PlayerContext {
    pub shell: Arc<Shell>,
    pub resolver: SourceResolver,
    pub tracker: Arc<DownloadTracker>,
    pub downloads: Arc<DownloadManager>,
    pub buffer_ms: u64,
}

pub struct Player {
    id: String,
    ctx: Arc<PlayerContext>,
    backend: Arc<dyn AudioBackend>,
    sink: QueuingEventSink,
    state: Mutex<PlayerState>,
    this: Weak<Player>,
}

struct PlayerState {
    options: PlayerOptions,
    initialized: bool,
    /// Last backend status the heartbeat saw.
    observed: PlaybackStatus,
    observed_playing: bool,
    /// `downloadState` refreshes run on the progress pulse while set.
    refreshing: bool,
    progress_listener: Option<ListenerId>,
    removal_listener: Option<ListenerId>,
    disposed: bool,
}

impl Player {
    /// Build and prepare a player. Fails when the source cannot be resolved.
    pub fn create(
        id: String,
        ctx: Arc<PlayerContext>,
        backend: Arc<dyn AudioBackend>,
        options: PlayerOptions,
    ) -> Result<Arc<Self>> {
        let player = Arc::new_cyclic(|this| Player {
            id,
            ctx,
            backend,
            sink: QueuingEventSink::new(),
            state: Mutex::new(PlayerState {
                options,
                initialized: false,
                observed: PlaybackStatus::Idle,
                observed_playing: false,
                refreshing: false,
                progress_listener: None,
                removal_listener: None,
                disposed: false,
            }),
            this: this.clone(),
        });
        player.prepare()?;
        Ok(player)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> PlayerOptions {
        self.state.lock().options.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn EventDelegate>>) {
        self.sink.set_delegate(delegate);
    }

    /// Resolve the source and hand a fresh request to the backend. A retry
    /// of the same source keeps `initialized`, so it is announced once.
    fn prepare(&self) -> Result<()> {
        let (source, clip, looping) = {
            let st = self.state.lock();
            (st.options.source.clone(), st.options.clip, st.options.looping)
        };
        let resolved = self.ctx.resolver.resolve(&source)?;
        log::info!("reprise: player {} preparing {}", self.id, resolved);
        self.backend.prepare(&PlaybackRequest {
            source: resolved,
            clip,
            looping,
            buffer_ms: self.ctx.buffer_ms,
        });
        self.state.lock().observed = PlaybackStatus::Idle;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    pub fn play(&self) -> Result<()> {
        match self.backend.status() {
            PlaybackStatus::Idle | PlaybackStatus::Error(_) => self.prepare()?,
            PlaybackStatus::Ended => self.backend.seek(0),
            PlaybackStatus::Buffering | PlaybackStatus::Ready => {}
        }
        self.backend.set_play_when_ready(true);
        Ok(())
    }

    pub fn pause(&self) {
        self.backend.set_play_when_ready(false);
    }

    /// `true` loops forever; `false` falls back to the looping times the
    /// player was created with.
    pub fn set_looping(&self, looping: bool) {
        let policy = if looping {
            Looping::Forever
        } else {
            self.state.lock().options.looping
        };
        self.backend.set_looping(policy);
    }

    pub fn set_volume(&self, volume: f64) {
        self.backend.set_volume(volume.clamp(0.0, 1.0) as f32);
    }

    /// `location_ms` is relative to the clip start.
    pub fn seek_to(&self, location_ms: i64) {
        self.backend.seek(location_ms.max(0) as u64);
    }

    /// Current position; also reports how far the source is buffered.
    pub fn position(&self) -> u64 {
        let position = self.backend.position_ms();
        self.send_buffering_update();
        position
    }

    /// Ignored until the player has initialized.
    pub fn set_speed(&self, speed: f64) {
        if !self.is_initialized() {
            log::debug!("reprise: player {} ignoring speed before init", self.id);
            return;
        }
        if speed > 0.0 && speed.is_finite() {
            self.backend.set_speed(speed as f32);
        }
    }

    /// Stop, swap in new options and prepare again.
    pub fn reset(&self, options: PlayerOptions) -> Result<()> {
        self.backend.stop();
        {
            let mut st = self.state.lock();
            st.options = options;
            st.initialized = false;
        }
        self.prepare()
    }

    /// Stop playback, close the event stream and drop tracker listeners.
    pub fn dispose(&self) {
        let listeners = {
            let mut st = self.state.lock();
            if st.disposed {
                return;
            }
            st.disposed = true;
            st.refreshing = false;
            [st.progress_listener.take(), st.removal_listener.take()]
        };
        for id in listeners.into_iter().flatten() {
            self.ctx.tracker.remove_listener(id);
        }
        self.backend.stop();
        self.sink.end_of_stream();
        log::info!("reprise: player {} disposed", self.id);
    }

    /// Turn backend transitions into events. Called on every heartbeat.
    pub fn poll(&self) {
        let status = self.backend.status();
        let playing = self.backend.play_when_ready();

        let mut events = Vec::new();
        let mut failure = None;
        {
            let mut st = self.state.lock();
            if st.disposed {
                return;
            }
            let status_changed = status != st.observed;
            let playing_changed = playing != st.observed_playing;
            st.observed = status.clone();
            st.observed_playing = playing;

            match &status {
                PlaybackStatus::Buffering if status_changed => {
                    events.push(PlayerEvent::BufferingStart);
                    events.push(self.buffering_update());
                }
                PlaybackStatus::Ready if status_changed || playing_changed => {
                    events.push(PlayerEvent::BufferingEnd);
                    events.push(PlayerEvent::PlayStateChanged { is_playing: playing });
                    if !st.initialized {
                        st.initialized = true;
                        events.push(PlayerEvent::Initialized {
                            duration: self.backend.duration_ms().unwrap_or(0),
                        });
                    }
                }
                PlaybackStatus::Ended if status_changed => events.push(PlayerEvent::Completed),
                PlaybackStatus::Error(message) if status_changed => failure = Some(message.clone()),
                _ => {}
            }
        }

        for event in events {
            self.emit(event);
        }
        if let Some(message) = failure {
            log::error!("reprise: player {} error: {}", self.id, message);
            self.emit_error(
                "AudioError",
                &format!("Audio player had error {}", message),
                Some(message.clone()),
            );
        }
    }

    fn buffering_update(&self) -> PlayerEvent {
        PlayerEvent::BufferingUpdate {
            values: vec![0, self.backend.buffered_ms()],
        }
    }

    fn send_buffering_update(&self) {
        self.emit(self.buffering_update());
    }

    // -----------------------------------------------------------------------
    // Downloads
    // -----------------------------------------------------------------------

    fn remote_uri(&self) -> Option<String> {
        self.state.lock().options.source.remote_uri().map(String::from)
    }

    /// Report the current state, auto-download if asked, and keep reporting
    /// while a download exists.
    pub fn init_download_state(&self, auto_cache: bool) -> Result<()> {
        let download = self.send_download_state();
        let state = download.as_ref().map(|d| d.state);
        if auto_cache && !matches!(state, Some(DownloadState::Downloading | DownloadState::Completed)) {
            self.do_download("")?;
        }
        if download.is_some() {
            self.state.lock().refreshing = true;
        }
        Ok(())
    }

    /// Queue a download of this player's source. Files and assets are
    /// already local and are ignored.
    pub fn do_download(&self, name: &str) -> Result<()> {
        let uri = match self.remote_uri() {
            Some(uri) => uri,
            None => return Ok(()),
        };
        self.watch_progress();
        self.ctx.downloads.add_download(DownloadRequest::new(&uri, name))
    }

    /// Start refreshing once the tracker reports any change.
    fn watch_progress(&self) {
        if self.state.lock().progress_listener.is_some() {
            return;
        }
        let this = self.this.clone();
        let id = self.ctx.tracker.add_listener(Arc::new(move || {
            if let Some(player) = this.upgrade() {
                let mut st = player.state.lock();
                if !st.disposed && st.progress_listener.is_some() {
                    st.refreshing = true;
                }
            }
        }));
        let stale = {
            let mut st = self.state.lock();
            if st.disposed {
                Some(id)
            } else {
                st.progress_listener.replace(id)
            }
        };
        if let Some(stale) = stale {
            self.ctx.tracker.remove_listener(stale);
        }
    }

    /// Remove this player's download; the state is reported once the
    /// tracker no longer knows it.
    pub fn remove_download(&self) -> Result<()> {
        let uri = match self.remote_uri() {
            Some(uri) => uri,
            None => return Ok(()),
        };
        let download = match self.ctx.tracker.download(&uri) {
            Some(d) => d,
            None => return Ok(()),
        };

        let this = self.this.clone();
        let watched = uri.clone();
        let id = self.ctx.tracker.add_listener(Arc::new(move || {
            let player = match this.upgrade() {
                Some(p) => p,
                None => return,
            };
            if player.ctx.tracker.download(&watched).is_some() {
                return;
            }
            player.send_download_state();
            let own = player.state.lock().removal_listener.take();
            if let Some(own) = own {
                player.ctx.tracker.remove_listener(own);
            }
        }));
        if let Some(previous) = self.state.lock().removal_listener.replace(id) {
            self.ctx.tracker.remove_listener(previous);
        }

        self.ctx.downloads.remove_download(&download.request.id)
    }

    /// Progress pulse: report the state until the download is terminal.
    pub fn refresh_progress(&self) {
        if !self.state.lock().refreshing {
            return;
        }
        let download = self.send_download_state();
        if download.as_ref().map_or(false, Download::is_terminal) {
            let listener = {
                let mut st = self.state.lock();
                st.refreshing = false;
                st.progress_listener.take()
            };
            if let Some(id) = listener {
                self.ctx.tracker.remove_listener(id);
            }
        }
    }

    fn send_download_state(&self) -> Option<Download> {
        let download = self
            .remote_uri()
            .and_then(|uri| self.ctx.tracker.download(&uri));
        let (state, progress) = ClientDownloadState::from_download(download.as_ref());
        self.emit(PlayerEvent::DownloadState { state, progress });
        download
    }

    // -----------------------------------------------------------------------
    // Event stream
    // -----------------------------------------------------------------------

    fn emit(&self, event: PlayerEvent) {
        self.mirror(&SinkMessage::Success { event: event.clone() });
        self.sink.success(event);
    }

    fn emit_error(&self, code: &str, message: &str, details: Option<String>) {
        self.mirror(&SinkMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            details: details.clone(),
        });
        self.sink.error(code, message, details);
    }

    fn mirror(&self, message: &SinkMessage) {
        log_err(
            self.ctx.shell.put(&paths::player_event_path(&self.id), message.to_value()),
            "mirror player event",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::sink::BufferDelegate;
    use crate::test_support::{temp_shell, wait_until, MemoryFetcher, ScriptedBackend};

    const URI: &str = "https://cdn.example.com/lesson.mp3";

    struct Fixture {
        _dir: tempfile::TempDir,
        _guard: parking_lot::MutexGuard<'static, ()>,
        ctx: Arc<PlayerContext>,
        fetcher: Arc<MemoryFetcher>,
        worker: Option<std::thread::JoinHandle<()>>,
    }

    impl Fixture {
        fn new() -> Self {
            let (dir, shell, guard) = temp_shell("test-player");
            let config = EngineConfig {
                cache_dir: dir.path().join("cache"),
                asset_root: dir.path().to_path_buf(),
                ..EngineConfig::default()
            };
            let fetcher = Arc::new(MemoryFetcher::new());
            let downloads = Arc::new(DownloadManager::new(
                Arc::clone(&shell),
                &config,
                Arc::clone(&fetcher) as Arc<dyn crate::download::Fetcher>,
            ));
            let tracker = Arc::new(DownloadTracker::new(downloads.downloads()));
            downloads.add_listener(Arc::clone(&tracker) as Arc<dyn crate::download::DownloadListener>);
            let worker = Some(downloads.start());
            let resolver = SourceResolver::new(config.asset_root.clone(), Arc::clone(&tracker), Arc::clone(&downloads));
            Self {
                _dir: dir,
                _guard: guard,
                ctx: Arc::new(PlayerContext {
                    shell,
                    resolver,
                    tracker,
                    downloads,
                    buffer_ms: 100,
                }),
                fetcher,
                worker,
            }
        }

        fn player(&self, args: Value) -> (Arc<Player>, Arc<ScriptedBackend>, Arc<BufferDelegate>) {
            let backend = Arc::new(ScriptedBackend::default());
            let options = PlayerOptions::from_args(&args).unwrap();
            let player = Player::create("p1".into(), Arc::clone(&self.ctx), backend.clone(), options).unwrap();
            let delegate = Arc::new(BufferDelegate::new());
            player.set_delegate(Some(delegate.clone()));
            (player, backend, delegate)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.ctx.downloads.shutdown();
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    fn events(delegate: &BufferDelegate) -> Vec<Value> {
        delegate
            .drain()
            .into_iter()
            .map(|m| match m {
                SinkMessage::Success { event } => event.to_value(),
                other => other.to_value(),
            })
            .collect()
    }

    fn names(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["event"].as_str().or(e["kind"].as_str()).unwrap_or("").to_string())
            .collect()
    }

    #[test]
    fn options_parse_clip_and_loops() {
        let args = serde_json::json!({"uri": URI, "clipRange": [1000, -1], "loopingTimes": -1, "autoCache": true});
        let options = PlayerOptions::from_args(&args).unwrap();
        assert_eq!(options.clip, ClipRange::new(1000, None).unwrap());
        assert_eq!(options.looping, Looping::Forever);
        assert!(options.auto_cache);

        let bare = PlayerOptions::from_args(&serde_json::json!({"uri": "/tmp/a.mp3"})).unwrap();
        assert_eq!(bare.clip, ClipRange::FULL);
        assert_eq!(bare.looping, Looping::Once);
        assert!(PlayerOptions::from_args(&serde_json::json!({"clipRange": [0, 10]})).is_err());
    }

    #[test]
    fn lifecycle_events_in_order() {
        let fx = Fixture::new();
        let (player, backend, delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.set_duration(Some(3000));

        backend.set_status(PlaybackStatus::Buffering);
        backend.set_buffered(1200);
        player.poll();
        backend.set_status(PlaybackStatus::Ready);
        player.poll();
        player.poll();

        let got = events(&delegate);
        assert_eq!(
            names(&got),
            vec!["bufferingStart", "bufferingUpdate", "bufferingEnd", "playStateChanged", "initialized"]
        );
        assert_eq!(got[1]["values"], serde_json::json!([0, 1200]));
        assert_eq!(got[3]["isPlaying"], false);
        assert_eq!(got[4]["duration"], 3000);

        player.play().unwrap();
        player.poll();
        let got = events(&delegate);
        assert_eq!(names(&got), vec!["bufferingEnd", "playStateChanged"]);
        assert_eq!(got[1]["isPlaying"], true);

        backend.set_status(PlaybackStatus::Ended);
        player.poll();
        assert_eq!(names(&events(&delegate)), vec!["completed"]);
    }

    #[test]
    fn initialized_once_per_prepare() {
        let fx = Fixture::new();
        let (player, backend, delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.set_status(PlaybackStatus::Ready);
        player.poll();
        backend.set_status(PlaybackStatus::Buffering);
        player.poll();
        backend.set_status(PlaybackStatus::Ready);
        player.poll();
        let got = names(&events(&delegate));
        assert_eq!(got.iter().filter(|n| *n == "initialized").count(), 1);

        player.reset(PlayerOptions::from_args(&serde_json::json!({"uri": "/tmp/b.mp3"})).unwrap()).unwrap();
        assert!(!player.is_initialized());
        backend.set_status(PlaybackStatus::Ready);
        player.poll();
        let got = names(&events(&delegate));
        assert!(got.contains(&"initialized".to_string()));
        assert_eq!(backend.prepares(), 2);
    }

    #[test]
    fn backend_error_reaches_channel() {
        let fx = Fixture::new();
        let (player, backend, delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.set_status(PlaybackStatus::Error("bad header".into()));
        player.poll();
        let got = events(&delegate);
        assert_eq!(got[0]["kind"], "error");
        assert_eq!(got[0]["code"], "AudioError");
        assert_eq!(got[0]["message"], "Audio player had error bad header");

        // Play after an error prepares again.
        player.play().unwrap();
        assert_eq!(backend.prepares(), 2);
        assert!(backend.play_when_ready());
    }

    #[test]
    fn retry_after_error_is_not_announced_again() {
        let fx = Fixture::new();
        let (player, backend, delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.set_duration(Some(3000));
        backend.set_status(PlaybackStatus::Ready);
        player.poll();
        backend.set_status(PlaybackStatus::Error("stream dropped".into()));
        player.poll();
        assert!(player.is_initialized());

        player.play().unwrap();
        backend.set_status(PlaybackStatus::Buffering);
        player.poll();
        backend.set_status(PlaybackStatus::Ready);
        player.poll();

        let got = names(&events(&delegate));
        assert_eq!(got.iter().filter(|n| *n == "initialized").count(), 1);
        assert_eq!(got.last().map(String::as_str), Some("playStateChanged"));
        assert!(player.is_initialized());
    }

    #[test]
    fn play_after_end_restarts_from_clip_start() {
        let fx = Fixture::new();
        let (player, backend, _delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.set_status(PlaybackStatus::Ended);
        player.play().unwrap();
        assert_eq!(backend.last_seek(), Some(0));
        assert_eq!(backend.prepares(), 1);
    }

    #[test]
    fn speed_waits_for_init_and_volume_clamps() {
        let fx = Fixture::new();
        let (player, backend, _delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        player.set_speed(2.0);
        assert_eq!(backend.speed(), 1.0);

        backend.set_status(PlaybackStatus::Ready);
        player.poll();
        player.set_speed(1.5);
        assert_eq!(backend.speed(), 1.5);
        player.set_speed(0.0);
        assert_eq!(backend.speed(), 1.5);

        player.set_volume(3.0);
        assert_eq!(backend.volume(), 1.0);
        player.set_volume(-1.0);
        assert_eq!(backend.volume(), 0.0);
    }

    #[test]
    fn set_looping_false_restores_configured_times() {
        let fx = Fixture::new();
        let (player, backend, _delegate) =
            fx.player(serde_json::json!({"uri": "/tmp/a.mp3", "loopingTimes": 3}));
        player.set_looping(true);
        assert_eq!(backend.looping(), Some(Looping::Forever));
        player.set_looping(false);
        assert_eq!(backend.looping(), Some(Looping::Times(3)));
    }

    #[test]
    fn position_reports_buffering() {
        let fx = Fixture::new();
        let (player, backend, delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.seek(700);
        backend.set_buffered(2000);
        assert_eq!(player.position(), 700);
        let got = events(&delegate);
        assert_eq!(got[0]["event"], "bufferingUpdate");
        assert_eq!(got[0]["values"][1], 2000);
    }

    #[test]
    fn events_are_mirrored_to_scroll() {
        let fx = Fixture::new();
        let (player, backend, _delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        backend.set_status(PlaybackStatus::Ended);
        player.poll();
        let scroll = fx.ctx.shell.get(&paths::player_event_path("p1")).unwrap().unwrap();
        assert_eq!(scroll.data["kind"], "success");
        assert_eq!(scroll.data["event"]["event"], "completed");
    }

    #[test]
    fn file_sources_never_download() {
        let fx = Fixture::new();
        let (player, _backend, delegate) = fx.player(serde_json::json!({"uri": "/tmp/a.mp3"}));
        player.init_download_state(true).unwrap();
        player.do_download("Lesson").unwrap();
        assert!(fx.ctx.downloads.downloads().is_empty());
        let got = events(&delegate);
        assert_eq!(names(&got), vec!["downloadState"]);
        assert_eq!(got[0]["state"], 0);
    }

    #[test]
    fn auto_cache_downloads_and_reports_completion() {
        let fx = Fixture::new();
        fx.fetcher.insert(URI, vec![7u8; 4096]);
        let (player, _backend, delegate) = fx.player(serde_json::json!({"uri": URI}));
        player.init_download_state(true).unwrap();

        assert!(wait_until(3000, || fx.ctx.tracker.download_state(URI) == DownloadState::Completed));
        // First pulse reports completion and stops the refresh.
        player.refresh_progress();
        player.refresh_progress();

        let got = events(&delegate);
        let states: Vec<i64> = got
            .iter()
            .filter(|e| e["event"] == "downloadState")
            .map(|e| e["state"].as_i64().unwrap())
            .collect();
        assert_eq!(states.first(), Some(&0));
        assert_eq!(states.last(), Some(&2));
        assert_eq!(states.iter().filter(|s| **s == 2).count(), 1);
        assert_eq!(fx.ctx.tracker.listener_count(), 0);
    }

    #[test]
    fn remove_download_reports_once_gone() {
        let fx = Fixture::new();
        fx.fetcher.insert(URI, vec![1u8; 2048]);
        let (player, _backend, delegate) = fx.player(serde_json::json!({"uri": URI}));
        player.do_download("Lesson").unwrap();
        assert!(wait_until(3000, || fx.ctx.tracker.download_state(URI) == DownloadState::Completed));
        player.refresh_progress();
        delegate.drain();

        player.remove_download().unwrap();
        // The removal listener unsubscribes itself after reporting.
        assert!(wait_until(3000, || fx.ctx.tracker.listener_count() == 0));
        assert!(fx.ctx.tracker.download(URI).is_none());
        let got = events(&delegate);
        assert_eq!(names(&got), vec!["downloadState"]);
        assert_eq!(got[0]["state"], 0);
    }

    #[test]
    fn dispose_closes_stream_and_listeners() {
        let fx = Fixture::new();
        fx.fetcher.insert(URI, vec![1u8; 1024]);
        fx.fetcher.set_chunk_delay_ms(50);
        let (player, backend, delegate) = fx.player(serde_json::json!({"uri": URI}));
        player.do_download("Lesson").unwrap();
        assert_eq!(fx.ctx.tracker.listener_count(), 1);

        player.dispose();
        player.dispose();
        assert_eq!(fx.ctx.tracker.listener_count(), 0);
        assert_eq!(backend.status(), PlaybackStatus::Idle);
        let got = delegate.drain();
        assert_eq!(got.last(), Some(&SinkMessage::EndOfStream));
        fx.fetcher.set_chunk_delay_ms(0);
    }
}
