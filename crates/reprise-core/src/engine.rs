//! Reprise engine: method-call dispatcher over players and downloads.
//!
//! Owns a Shell, the download manager/tracker pair and every live player.
//! A beeclock heartbeat samples player state each frame and refreshes
//! download progress on its `progress` pulse; the download worker runs on
//! its own thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use beeclock_core::Clock;
use nine_s_shell::Shell;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::download::{DownloadListener, DownloadManager, DownloadTracker, Fetcher};
use crate::effects::notify::{DownloadNotifications, ScrollNotifier};
use crate::effects::BackendFactory;
use crate::error::{log_err, PluginError, Result};
use crate::models::args::{ArgsExt, MethodCall};
use crate::models::event::SinkMessage;
use crate::player::{Player, PlayerContext, PlayerOptions};
use crate::sink::{ChannelDelegate, EventDelegate};
use crate::source::SourceResolver;

const FRAME_PARTITION: &str = "frame";
const PROGRESS_PULSE: &str = "progress";

type Players = Arc<RwLock<HashMap<String, Arc<Player>>>>;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The reprise audio engine.
pub struct Engine {
    shell: Arc<Shell>,
    config: EngineConfig,
    ctx: Arc<PlayerContext>,
    notifications: Arc<DownloadNotifications>,
    backends: BackendFactory,
    players: Players,
    next_id: AtomicU64,
    /// Shutdown signal for the heartbeat.
    shutdown: Arc<AtomicBool>,
    /// Handles for joining background threads.
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Boot the engine with settings from the shell and the compiled-in
    /// backend and network stack.
    pub fn new(shell: Shell) -> Self {
        let config = EngineConfig::load(&shell);
        let fetcher = default_fetcher(&config);
        let backends = default_backends(Arc::clone(&fetcher));
        Self::with_parts(Arc::new(shell), config, backends, fetcher)
    }

    /// Boot the engine with explicit parts.
    ///
    /// Use a factory returning `NoopBackend` for headless hosts.
    pub fn with_parts(
        shell: Arc<Shell>,
        config: EngineConfig,
        backends: BackendFactory,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let downloads = Arc::new(DownloadManager::new(Arc::clone(&shell), &config, fetcher));

        let tracker = Arc::new(DownloadTracker::new(downloads.downloads()));
        downloads.add_listener(Arc::clone(&tracker) as Arc<dyn DownloadListener>);

        let notifier = Arc::new(ScrollNotifier::new(Arc::clone(&shell)));
        let notifications = Arc::new(DownloadNotifications::new(notifier));
        downloads.add_listener(Arc::clone(&notifications) as Arc<dyn DownloadListener>);

        let resolver = SourceResolver::new(config.asset_root.clone(), Arc::clone(&tracker), Arc::clone(&downloads));
        let ctx = Arc::new(PlayerContext {
            shell: Arc::clone(&shell),
            resolver,
            tracker,
            downloads,
            buffer_ms: config.buffer_ms,
        });

        Self {
            shell,
            config,
            ctx,
            notifications,
            backends,
            players: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the heartbeat and the download worker. Idempotent; calling
    /// twice is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        handles.push(self.ctx.downloads.start());
        handles.push(self.start_heartbeat());
        log::info!("reprise: engine started");
    }

    /// Dispose every player, stop background threads and wait for them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.dispose_all();
        self.ctx.downloads.shutdown();

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for handle in handles {
            let _ = handle.join();
        }
        log::info!("reprise: engine stopped");
    }

    /// Clock-driven heartbeat.
    ///
    /// Every tick samples each player's backend; the `progress` pulse
    /// refreshes the download notification and players' download state.
    fn start_heartbeat(&self) -> JoinHandle<()> {
        let players = Arc::clone(&self.players);
        let downloads = Arc::clone(&self.ctx.downloads);
        let notifications = Arc::clone(&self.notifications);
        let shutdown = Arc::clone(&self.shutdown);
        let tick = Duration::from_millis(self.config.tick_ms);
        let progress_every = self.config.progress_every_ticks();

        thread::spawn(move || {
            let mut clock = match build_clock(progress_every) {
                Some(clock) => clock,
                None => {
                    log::error!("reprise: heartbeat clock failed to build");
                    return;
                }
            };

            while !shutdown.load(Ordering::SeqCst) {
                thread::sleep(tick);

                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let outcome = clock.tick();
                let snapshot: Vec<Arc<Player>> = players.read().values().cloned().collect();

                for player in &snapshot {
                    player.poll();
                }

                if outcome.pulses.iter().any(|p| p.name == PROGRESS_PULSE) {
                    notifications.refresh_progress(&downloads.downloads());
                    for player in &snapshot {
                        player.refresh_progress();
                    }
                }
            }
        })
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Get reference to the 9S shell.
    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.ctx.downloads
    }

    pub fn tracker(&self) -> &Arc<DownloadTracker> {
        &self.ctx.tracker
    }

    /// Ids of live players, sorted.
    pub fn player_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.players.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Dispatch one method call. Results are JSON; `Value::Null` for calls
    /// without a return value.
    pub fn handle(&self, call: &MethodCall) -> Result<Value> {
        let args = &call.args;
        match call.method.as_str() {
            "init" => {
                self.dispose_all();
                Ok(Value::Null)
            }
            "create" => self.create(args),
            "reset" => {
                let player = self.player(args)?;
                let options = PlayerOptions::from_args(args)?;
                let auto_cache = options.auto_cache;
                player.reset(options)?;
                player.init_download_state(auto_cache)?;
                Ok(Value::Null)
            }
            "setLooping" => {
                let looping = args.require_bool("looping")?;
                self.player(args)?.set_looping(looping);
                Ok(Value::Null)
            }
            "setVolume" => {
                let volume = args.require_f64("volume")?;
                self.player(args)?.set_volume(volume);
                Ok(Value::Null)
            }
            "play" => {
                self.player(args)?.play()?;
                Ok(Value::Null)
            }
            "pause" => {
                self.player(args)?.pause();
                Ok(Value::Null)
            }
            "seekTo" => {
                let player = self.player(args)?;
                player.seek_to(args.i64_field("location").unwrap_or(0));
                Ok(Value::Null)
            }
            "position" => Ok(self.player(args)?.position().into()),
            "dispose" => {
                let player = self.player(args)?;
                player.dispose();
                self.players.write().remove(player.id());
                Ok(Value::Null)
            }
            "setSpeed" => {
                let player = self.player(args)?;
                player.set_speed(args.f64_field("speed").unwrap_or(0.0));
                Ok(Value::Null)
            }
            "download" => {
                let player = self.player(args)?;
                player.do_download(args.str_field("name").unwrap_or(""))?;
                Ok(Value::Null)
            }
            "removeDownload" => {
                self.player(args)?.remove_download()?;
                Ok(Value::Null)
            }
            "clearCache" => {
                self.ctx.downloads.clear_cache()?;
                Ok(Value::Null)
            }
            other => Err(PluginError::NotImplemented(other.to_string())),
        }
    }

    /// Attach a host to a player's event channel.
    pub fn listen(&self, player_id: &str, delegate: Arc<dyn EventDelegate>) -> Result<()> {
        self.player_by_id(player_id)?.set_delegate(Some(delegate));
        Ok(())
    }

    /// Detach the host; later events queue until the next `listen`.
    pub fn cancel(&self, player_id: &str) -> Result<()> {
        self.player_by_id(player_id)?.set_delegate(None);
        Ok(())
    }

    /// Listen through a channel receiver.
    pub fn listen_channel(&self, player_id: &str) -> Result<Receiver<SinkMessage>> {
        let (delegate, rx) = ChannelDelegate::new();
        self.listen(player_id, Arc::new(delegate))?;
        Ok(rx)
    }

    fn create(&self, args: &Value) -> Result<Value> {
        let options = PlayerOptions::from_args(args)?;
        let auto_cache = options.auto_cache;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();

        let player = Player::create(id.clone(), Arc::clone(&self.ctx), (self.backends)(), options)?;
        self.players.write().insert(id.clone(), Arc::clone(&player));
        log_err(player.init_download_state(auto_cache), "init download state");

        log::info!("reprise: created player {}", id);
        Ok(serde_json::json!({ "playerId": id }))
    }

    fn player(&self, args: &Value) -> Result<Arc<Player>> {
        self.player_by_id(args.require_str("playerId")?)
    }

    fn player_by_id(&self, id: &str) -> Result<Arc<Player>> {
        self.players
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::UnknownPlayer(id.to_string()))
    }

    fn dispose_all(&self) {
        let players: Vec<Arc<Player>> = self.players.write().drain().map(|(_, p)| p).collect();
        for player in players {
            player.dispose();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.dispose_all();
        self.ctx.downloads.shutdown();
        // Don't join here; threads exit on their shutdown flags
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

#[cfg(feature = "http")]
fn default_fetcher(config: &EngineConfig) -> Arc<dyn Fetcher> {
    Arc::new(crate::effects::http::HttpFetcher::new(config))
}

#[cfg(not(feature = "http"))]
fn default_fetcher(_config: &EngineConfig) -> Arc<dyn Fetcher> {
    Arc::new(crate::download::manager::UnsupportedFetcher)
}

#[cfg(feature = "native")]
fn default_backends(fetcher: Arc<dyn Fetcher>) -> BackendFactory {
    use crate::effects::audio::AudioEffect;
    Arc::new(move || Arc::new(AudioEffect::new(Arc::clone(&fetcher))) as Arc<dyn crate::effects::AudioBackend>)
}

#[cfg(not(feature = "native"))]
fn default_backends(_fetcher: Arc<dyn Fetcher>) -> BackendFactory {
    use crate::effects::NoopBackend;
    Arc::new(|| Arc::new(NoopBackend::default()) as Arc<dyn crate::effects::AudioBackend>)
}

/// One partition ticking per frame, wrapping at the progress pulse.
fn build_clock(progress_every: u64) -> Option<Clock> {
    Clock::builder()
        .least_significant_first()
        .partition(FRAME_PARTITION, progress_every)
        .pulse_every(PROGRESS_PULSE, progress_every)
        .build()
        .ok()
}
