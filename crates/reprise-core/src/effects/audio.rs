//! Audio effect handler: symphonia decode + cpal output.
//!
//! Rust-native audio pipeline:
//! 1. symphonia decodes (MP3, FLAC, AAC, OGG, WAV, ALAC) from a file or an
//!    HTTP stream
//! 2. samples outside the clip window are trimmed, the rest is resampled
//!    for the device rate and playback speed
//! 3. samples flow through a ring buffer
//! 4. cpal outputs to hardware (CoreAudio / ALSA / WASAPI)
//!
//! The decoder thread owns looping: at the end of the window it asks the
//! loop counter whether to seek back to the clip start or to finish.
//! Positions are clip-relative. Each run of samples pushed to the ring
//! carries the clip offset it starts at, so the playback position follows
//! what the device has pulled, across loop restarts included.

use std::collections::VecDeque;
use std::fs::File;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};

use super::{AudioBackend, PlaybackRequest, PlaybackStatus, ResolvedSource};
use crate::download::Fetcher;
use crate::models::looping::{LoopAction, LoopCounter, Looping};
use crate::source::extension_from_url;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const NO_SEEK: u64 = u64::MAX;
const UNKNOWN: u64 = u64::MAX;
/// Ring capacity in seconds of device audio.
const RING_SECONDS: usize = 2;

const IDLE: u8 = 0;
const BUFFERING: u8 = 1;
const READY: u8 = 2;
const ENDED: u8 = 3;
const ERROR: u8 = 4;

/// Thread-safe audio effect handler.
pub struct AudioEffect {
    state: Arc<AudioState>,
    fetcher: Arc<dyn Fetcher>,
}

struct AudioState {
    play_when_ready: AtomicBool,
    /// Volume 0-100 mapped to 0.0-1.0.
    volume: AtomicU32,
    /// Playback speed as `f32` bits.
    speed: AtomicU32,
    status: AtomicU8,
    error: Mutex<Option<String>>,
    /// Signal both threads to exit.
    stop_signal: AtomicBool,
    /// Pending clip-relative seek target (`NO_SEEK` when none).
    seek_to_ms: AtomicU64,
    /// Every loop has been decoded; the ring only drains from here on.
    decode_done: AtomicBool,
    /// Clip-relative position of the last sample pushed to the ring.
    decoded_ms: AtomicU64,
    /// Length of the playable window (`UNKNOWN` until probed).
    window_ms: AtomicU64,
    buffer_ms: AtomicU64,
    /// Source format, published by the decoder (0 until known).
    sample_rate: AtomicU32,
    channels: AtomicU32,
    /// Output format, published by the output thread (0 until known).
    device_rate: AtomicU32,
    output_channels: AtomicU32,
    looping: Mutex<LoopCounter>,
    /// Shared sample buffer: decoder writes, cpal reads.
    samples: Mutex<SampleRing>,
    /// Handles for decoder + output threads (joined on stop).
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioState {
    fn new() -> Self {
        Self {
            play_when_ready: AtomicBool::new(false),
            volume: AtomicU32::new(100),
            speed: AtomicU32::new(1.0f32.to_bits()),
            status: AtomicU8::new(IDLE),
            error: Mutex::new(None),
            stop_signal: AtomicBool::new(false),
            seek_to_ms: AtomicU64::new(NO_SEEK),
            decode_done: AtomicBool::new(false),
            decoded_ms: AtomicU64::new(0),
            window_ms: AtomicU64::new(UNKNOWN),
            buffer_ms: AtomicU64::new(250),
            sample_rate: AtomicU32::new(0),
            channels: AtomicU32::new(0),
            device_rate: AtomicU32::new(0),
            output_channels: AtomicU32::new(0),
            looping: Mutex::new(LoopCounter::new(Looping::Once)),
            samples: Mutex::new(SampleRing::new(48000 * 2 * RING_SECONDS)),
            threads: Mutex::new(Vec::new()),
        }
    }

    fn speed(&self) -> f32 {
        f32::from_bits(self.speed.load(Ordering::SeqCst))
    }

    fn stopped(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    fn fail(&self, message: String) {
        *self.error.lock() = Some(message);
        self.status.store(ERROR, Ordering::SeqCst);
    }

    /// Move from one status to another; no-op if the status changed meanwhile.
    fn transition(&self, from: u8, to: u8) -> bool {
        self.status
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Queued audio in source milliseconds.
    fn ring_ms(&self) -> u64 {
        let len = self.samples.lock().len as u64;
        let per_second = self.channels.load(Ordering::SeqCst).max(1) as u64
            * self.device_rate.load(Ordering::SeqCst).max(1) as u64;
        let device_ms = len * 1000 / per_second;
        (device_ms as f64 * self.speed() as f64) as u64
    }

    /// Clip-relative position of the audio the device is playing.
    fn position_ms(&self) -> u64 {
        let played = self.samples.lock().played_ms();
        let position = played.unwrap_or_else(|| self.decoded_ms.load(Ordering::SeqCst));
        match self.window_ms.load(Ordering::SeqCst) {
            UNKNOWN => position,
            window => position.min(window),
        }
    }

    /// Buffering → Ready once enough audio is queued, the ring is half
    /// full, or there is nothing left to decode.
    fn check_ready(&self) {
        if self.status.load(Ordering::SeqCst) != BUFFERING {
            return;
        }
        let half_full = {
            let ring = self.samples.lock();
            ring.len * 2 >= ring.buf.len()
        };
        if self.decode_done.load(Ordering::SeqCst)
            || half_full
            || self.ring_ms() >= self.buffer_ms.load(Ordering::SeqCst)
        {
            self.transition(BUFFERING, READY);
        }
    }
}

/// Where a run of queued samples sits in the clip.
#[derive(Debug, Clone, Copy)]
struct Mark {
    /// Ring sample count (since the last clear) at the first sample.
    at: u64,
    offset_ms: u64,
    /// Clip milliseconds covered by one interleaved device sample.
    ms_per_sample: f64,
}

/// Device-rate sample queue between the decoder and the output callback.
/// Marks map queued samples back to clip offsets, so a loop restart in the
/// queue does not disturb the reported position.
struct SampleRing {
    buf: Vec<f32>,
    read_pos: usize,
    write_pos: usize,
    len: usize,
    pushed: u64,
    pulled: u64,
    marks: VecDeque<Mark>,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0.0; capacity],
            read_pos: 0,
            write_pos: 0,
            len: 0,
            pushed: 0,
            pulled: 0,
            marks: VecDeque::new(),
        }
    }

    fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Queue samples; whatever does not fit is dropped.
    fn push(&mut self, samples: &[f32]) {
        let accepted = samples.len().min(self.free());
        for &s in &samples[..accepted] {
            self.buf[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.buf.len();
        }
        self.len += accepted;
        self.pushed += accepted as u64;
    }

    /// Queue a run of samples starting at `offset_ms` in the clip.
    fn push_marked(&mut self, samples: &[f32], offset_ms: u64, ms_per_sample: f64) {
        if samples.is_empty() || self.free() == 0 {
            return;
        }
        self.marks.push_back(Mark {
            at: self.pushed,
            offset_ms,
            ms_per_sample,
        });
        self.push(samples);
    }

    /// Fill `out`, zero-padding past the queued audio. Returns the number
    /// of queued samples used.
    fn pull(&mut self, out: &mut [f32]) -> usize {
        let n = out.len().min(self.len);
        for sample in &mut out[..n] {
            *sample = self.buf[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.buf.len();
        }
        out[n..].fill(0.0);
        self.len -= n;
        self.pulled += n as u64;
        while self.marks.len() > 1 && self.marks[1].at <= self.pulled {
            self.marks.pop_front();
        }
        n
    }

    /// Clip offset of the next sample the device will pull; `None` before
    /// any marked audio was queued.
    fn played_ms(&self) -> Option<u64> {
        let mark = self.marks.front()?;
        let into_run = self.pulled.saturating_sub(mark.at) as f64;
        Some(mark.offset_ms + (into_run * mark.ms_per_sample) as u64)
    }

    fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.len = 0;
        self.pushed = 0;
        self.pulled = 0;
        self.marks.clear();
    }
}

/// Linear interpolation resampler. Speed is folded into the ratio, so
/// pitch follows speed.
struct LinearResampler {
    ratio: f64,
    phase: f64,
    channels: usize,
}

impl LinearResampler {
    fn new(src_rate: u32, dst_rate: u32, channels: u16, speed: f32) -> Self {
        Self {
            ratio: dst_rate as f64 / (src_rate as f64 * speed as f64),
            phase: 0.0,
            channels: channels as usize,
        }
    }

    fn is_needed(&self) -> bool {
        (self.ratio - 1.0).abs() > 0.001
    }

    /// Resample interleaved samples. Returns resampled output.
    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if !self.is_needed() {
            return input.to_vec();
        }
        let ch = self.channels;
        let in_frames = input.len() / ch;
        if in_frames == 0 {
            return Vec::new();
        }
        let out_frames = ((in_frames as f64) * self.ratio).ceil() as usize;
        let mut output = Vec::with_capacity(out_frames * ch);

        for _ in 0..out_frames {
            let src_idx = self.phase as usize;
            if src_idx >= in_frames {
                break;
            }
            let frac = (self.phase - src_idx as f64) as f32;

            for c in 0..ch {
                let s0 = input[src_idx * ch + c];
                let s1 = if src_idx + 1 < in_frames {
                    input[(src_idx + 1) * ch + c]
                } else {
                    s0
                };
                output.push(s0 + (s1 - s0) * frac);
            }

            self.phase += 1.0 / self.ratio;
        }

        self.phase -= in_frames as f64;
        if self.phase < 0.0 {
            self.phase = 0.0;
        }

        output
    }
}

impl AudioEffect {
    /// `fetcher` opens remote sources.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            state: Arc::new(AudioState::new()),
            fetcher,
        }
    }
}

impl AudioBackend for AudioEffect {
    /// Spawn decoder + output threads for a new request.
    ///
    /// stop() is called first and blocks until old threads exit; no ghost
    /// threads. Probing happens on the decoder thread; the output thread
    /// opens the device once the source format is known.
    fn prepare(&self, request: &PlaybackRequest) {
        self.stop();

        let state = &self.state;
        state.stop_signal.store(false, Ordering::SeqCst);
        *state.error.lock() = None;
        state.status.store(BUFFERING, Ordering::SeqCst);
        state.seek_to_ms.store(NO_SEEK, Ordering::SeqCst);
        state.decode_done.store(false, Ordering::SeqCst);
        state.decoded_ms.store(0, Ordering::SeqCst);
        state.window_ms.store(UNKNOWN, Ordering::SeqCst);
        state.buffer_ms.store(request.buffer_ms, Ordering::SeqCst);
        state.sample_rate.store(0, Ordering::SeqCst);
        state.channels.store(0, Ordering::SeqCst);
        state.device_rate.store(0, Ordering::SeqCst);
        *state.looping.lock() = LoopCounter::new(request.looping);
        state.samples.lock().clear();

        let mut threads = state.threads.lock();

        let decoder_state = Arc::clone(state);
        let fetcher = Arc::clone(&self.fetcher);
        let request = request.clone();
        threads.push(thread::spawn(move || {
            if let Err(e) = decode_to_ring(&request, &decoder_state, &*fetcher) {
                log::error!("reprise: decode error for {}: {}", request.source, e);
                decoder_state.fail(e.to_string());
            }
        }));

        let output_state = Arc::clone(state);
        threads.push(thread::spawn(move || {
            let err_state = Arc::clone(&output_state);
            if let Err(e) = output_from_ring(output_state) {
                log::error!("reprise: output error: {}", e);
                err_state.fail(e.to_string());
            }
        }));
    }

    fn set_play_when_ready(&self, play: bool) {
        self.state.play_when_ready.store(play, Ordering::SeqCst);
    }

    fn play_when_ready(&self) -> bool {
        self.state.play_when_ready.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.state.stop_signal.store(true, Ordering::SeqCst);
        self.state.samples.lock().clear(); // Clear first so output thread exits fast

        // Drain handles then join outside the lock
        let handles: Vec<_> = self.state.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.state.status.store(IDLE, Ordering::SeqCst);
    }

    fn seek(&self, offset_ms: u64) {
        self.state.seek_to_ms.store(offset_ms, Ordering::SeqCst);
    }

    fn set_volume(&self, volume: f32) {
        let v = (volume.clamp(0.0, 1.0) * 100.0) as u32;
        self.state.volume.store(v, Ordering::SeqCst);
    }

    fn set_speed(&self, speed: f32) {
        if speed > 0.0 && speed.is_finite() {
            self.state.speed.store(speed.to_bits(), Ordering::SeqCst);
        }
    }

    fn set_looping(&self, looping: Looping) {
        self.state.looping.lock().set_looping(looping);
    }

    fn status(&self) -> PlaybackStatus {
        match self.state.status.load(Ordering::SeqCst) {
            BUFFERING => PlaybackStatus::Buffering,
            READY => PlaybackStatus::Ready,
            ENDED => PlaybackStatus::Ended,
            ERROR => PlaybackStatus::Error(
                self.state
                    .error
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown error".into()),
            ),
            _ => PlaybackStatus::Idle,
        }
    }

    fn position_ms(&self) -> u64 {
        self.state.position_ms()
    }

    fn buffered_ms(&self) -> u64 {
        self.state.decoded_ms.load(Ordering::SeqCst)
    }

    fn duration_ms(&self) -> Option<u64> {
        match self.state.window_ms.load(Ordering::SeqCst) {
            UNKNOWN => None,
            ms => Some(ms),
        }
    }
}

impl Drop for AudioEffect {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// An opened source: demuxer + decoder for its default track.
struct Session {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u32,
    time_base: Option<TimeBase>,
    total_ms: Option<u64>,
}

impl Session {
    fn open(source: &ResolvedSource, fetcher: &dyn Fetcher) -> Result<Self, BoxError> {
        let mut hint = Hint::new();
        let mss = match source {
            ResolvedSource::Local(path) => {
                if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                    hint.with_extension(ext);
                }
                MediaSourceStream::new(Box::new(File::open(path)?), Default::default())
            }
            ResolvedSource::Remote(uri) => {
                if let Some(ext) = extension_from_url(uri) {
                    hint.with_extension(&ext);
                }
                let response = fetcher.fetch(uri, 0)?;
                let source = ReadOnlySource::new(response.reader);
                MediaSourceStream::new(Box::new(source), Default::default())
            }
        };

        let probed = symphonia::default::get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;

        let format = probed.format;
        let track = format.default_track().ok_or("no default track")?;
        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);
        let channels = track.codec_params.channels.map(|c| c.count() as u32).unwrap_or(2);
        let time_base = track.codec_params.time_base;
        let total_ms = track
            .codec_params
            .n_frames
            .map(|n| frames_to_ms(n, sample_rate as u64));

        let decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base,
            total_ms,
        })
    }

    /// Accurate seek to an absolute position. False when the source cannot
    /// seek (network streams).
    fn seek(&mut self, abs_ms: u64) -> bool {
        let time = Time::new(abs_ms / 1000, (abs_ms % 1000) as f64 / 1000.0);
        match self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(self.track_id),
            },
        ) {
            Ok(_) => {
                self.decoder.reset();
                true
            }
            Err(e) => {
                log::debug!("reprise: seek to {}ms failed: {}", abs_ms, e);
                false
            }
        }
    }

    /// Packet timestamp → frame index at the source rate.
    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) if tb.denom > 0 => {
                (ts as u128 * tb.numer as u128 * self.sample_rate as u128 / tb.denom as u128) as u64
            }
            _ => ts,
        }
    }
}

enum SessionEnd {
    Stopped,
    /// The source has to be opened again at this absolute position.
    Reopen(u64),
}

enum Push {
    Done,
    Stopped,
    SeekPending,
}

/// Decode the clip window into the ring, looping as the counter says.
fn decode_to_ring(
    request: &PlaybackRequest,
    state: &AudioState,
    fetcher: &dyn Fetcher,
) -> Result<(), BoxError> {
    let mut start_abs = request.clip.start_ms;
    let mut first_open = true;

    loop {
        let mut session = Session::open(&request.source, fetcher)?;

        if first_open {
            first_open = false;
            state.sample_rate.store(session.sample_rate, Ordering::SeqCst);
            state.channels.store(session.channels, Ordering::SeqCst);

            let total = session.total_ms.or_else(|| match &request.source {
                ResolvedSource::Local(path) => super::probe::duration_ms(path),
                ResolvedSource::Remote(_) => None,
            });
            if let Some(window) = request.clip.window_ms(total) {
                state.window_ms.store(window, Ordering::SeqCst);
            }

            if !wait_for_output(state) {
                return Ok(());
            }
            let device_rate = state.device_rate.load(Ordering::SeqCst) as usize;
            *state.samples.lock() =
                SampleRing::new(device_rate * session.channels.max(1) as usize * RING_SECONDS);
            if device_rate as u32 != session.sample_rate {
                log::info!("reprise: resampling {}Hz -> {}Hz", session.sample_rate, device_rate);
            }
        }

        match run_session(&mut session, request, state, start_abs)? {
            SessionEnd::Stopped => return Ok(()),
            SessionEnd::Reopen(abs) => start_abs = abs,
        }
    }
}

/// Wait until the output thread has picked a device format.
fn wait_for_output(state: &AudioState) -> bool {
    loop {
        if state.device_rate.load(Ordering::SeqCst) != 0 {
            return true;
        }
        if state.stopped() || state.status.load(Ordering::SeqCst) == ERROR {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn run_session(
    session: &mut Session,
    request: &PlaybackRequest,
    state: &AudioState,
    start_abs: u64,
) -> Result<SessionEnd, BoxError> {
    let clip = request.clip;
    let rate = session.sample_rate as u64;
    let device_rate = state.device_rate.load(Ordering::SeqCst);
    let end_frame = clip.end_ms.map(|end| ms_to_frames(end, rate));
    let clip_start_frame = ms_to_frames(clip.start_ms, rate);

    let mut discard_until = ms_to_frames(start_abs, rate);
    let mut position_frame = 0u64;
    if start_abs > 0 && session.seek(start_abs) {
        position_frame = discard_until;
    }
    state.decoded_ms.store(clip.to_offset(start_abs), Ordering::SeqCst);

    let mut speed = state.speed();
    let mut resampler = LinearResampler::new(session.sample_rate, device_rate, session.channels as u16, speed);

    loop {
        if state.stopped() {
            return Ok(SessionEnd::Stopped);
        }

        // --- Seek requests ---
        let seek = state.seek_to_ms.swap(NO_SEEK, Ordering::SeqCst);
        if seek != NO_SEEK {
            // Offsets past the window land on its end.
            let offset = match state.window_ms.load(Ordering::SeqCst) {
                UNKNOWN => seek,
                window => seek.min(window),
            };
            let abs = clip.to_abs(offset);

            // Seeking once playback has ended starts the loops over; while
            // the last loop still drains, the seek stays inside it.
            let status = state.status.load(Ordering::SeqCst);
            if status == ENDED {
                state.looping.lock().reset();
            }
            state.decode_done.store(false, Ordering::SeqCst);
            state.samples.lock().clear();
            if status != ERROR {
                state.status.store(BUFFERING, Ordering::SeqCst);
            }
            state.decoded_ms.store(offset, Ordering::SeqCst);
            resampler = LinearResampler::new(session.sample_rate, device_rate, session.channels as u16, speed);

            let target = ms_to_frames(abs, rate);
            if session.seek(abs) {
                position_frame = target;
            } else if target < position_frame {
                return Ok(SessionEnd::Reopen(abs));
            }
            discard_until = target;
        }

        if state.decode_done.load(Ordering::SeqCst) {
            state.check_ready();
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        // --- Decode ---
        let packet = match session.format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                match window_end(session, state, clip.start_ms) {
                    Some(end) => return Ok(end),
                    None => {
                        discard_until = clip_start_frame;
                        position_frame = clip_start_frame;
                        continue;
                    }
                }
            }
            Err(SymphoniaError::ResetRequired) => {
                session.decoder.reset();
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != session.track_id {
            continue;
        }

        let packet_start = session.ts_to_frames(packet.ts());
        let decoded = match session.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                log::warn!("reprise: skipping undecodable packet: {}", msg);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let spec = *decoded.spec();
        let n_frames = decoded.frames() as u64;
        position_frame = packet_start + n_frames;

        let (skip, take_end, reached_end) = trim_bounds(packet_start, n_frames, discard_until, end_frame);
        if take_end > skip {
            let mut sample_buf = SampleBuffer::<f32>::new(n_frames, spec);
            sample_buf.copy_interleaved_ref(decoded);
            let ch = spec.channels.count();
            let window = &sample_buf.samples()[skip as usize * ch..take_end as usize * ch];

            let current_speed = state.speed();
            if current_speed.to_bits() != speed.to_bits() {
                speed = current_speed;
                resampler = LinearResampler::new(session.sample_rate, device_rate, ch as u16, speed);
            }
            let samples = resampler.process(window);
            let offset_ms = clip.to_offset(frames_to_ms(packet_start + skip, rate));
            let ms_per_sample = 1000.0 * speed as f64 / (device_rate.max(1) as f64 * ch as f64);

            match push_to_ring(state, &samples, offset_ms, ms_per_sample) {
                Push::Done => {}
                Push::Stopped => return Ok(SessionEnd::Stopped),
                Push::SeekPending => continue,
            }

            let decoded_abs = frames_to_ms(packet_start + take_end, rate);
            state.decoded_ms.store(clip.to_offset(decoded_abs), Ordering::SeqCst);
            state.check_ready();
        }

        if reached_end {
            match window_end(session, state, clip.start_ms) {
                Some(end) => return Ok(end),
                None => {
                    discard_until = clip_start_frame;
                    position_frame = clip_start_frame;
                }
            }
        }
    }
}

/// The window has played through: restart it or finish. Returns `Some`
/// when the session has to end.
fn window_end(session: &mut Session, state: &AudioState, clip_start_ms: u64) -> Option<SessionEnd> {
    let action = state.looping.lock().on_window_end();
    match action {
        LoopAction::Restart => {
            state.decoded_ms.store(0, Ordering::SeqCst);
            if session.seek(clip_start_ms) {
                None
            } else {
                Some(SessionEnd::Reopen(clip_start_ms))
            }
        }
        LoopAction::Complete => {
            state.decode_done.store(true, Ordering::SeqCst);
            state.check_ready();
            None
        }
    }
}

/// Push to ring, back-pressure if full.
fn push_to_ring(state: &AudioState, samples: &[f32], offset_ms: u64, ms_per_sample: f64) -> Push {
    loop {
        {
            let mut ring = state.samples.lock();
            if ring.free() >= samples.len() || samples.len() >= ring.buf.len() {
                ring.push_marked(samples, offset_ms, ms_per_sample);
                return Push::Done;
            }
        }
        state.check_ready();
        thread::sleep(Duration::from_millis(5));

        if state.stopped() {
            return Push::Stopped;
        }
        if state.seek_to_ms.load(Ordering::SeqCst) != NO_SEEK {
            return Push::SeekPending;
        }
    }
}

/// Which frames of a packet fall inside the window: `(skip, take_end,
/// reached_end)`. Frames `[skip, take_end)` are kept; `reached_end` is set
/// once the packet touches the window end.
fn trim_bounds(packet_start: u64, n_frames: u64, discard_until: u64, end_frame: Option<u64>) -> (u64, u64, bool) {
    let skip = discard_until.saturating_sub(packet_start).min(n_frames);
    let take_end = end_frame.map_or(n_frames, |end| end.saturating_sub(packet_start).min(n_frames));
    let reached_end = end_frame.map_or(false, |end| packet_start + n_frames >= end);
    (skip, take_end, reached_end)
}

fn ms_to_frames(ms: u64, rate: u64) -> u64 {
    ms * rate / 1000
}

fn frames_to_ms(frames: u64, rate: u64) -> u64 {
    if rate == 0 {
        return 0;
    }
    frames * 1000 / rate
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Pull samples from the ring buffer and send to cpal output.
///
/// Takes Arc so the cpal callback closure can hold a safe reference
/// without raw pointers. The stream is configured at the track's sample
/// rate when the device supports it; otherwise the device default is used
/// and the decoder resamples.
fn output_from_ring(state: Arc<AudioState>) -> Result<(), BoxError> {
    // Wait for the decoder to publish the source format.
    loop {
        if state.stopped() || state.status.load(Ordering::SeqCst) == ERROR {
            return Ok(());
        }
        if state.sample_rate.load(Ordering::SeqCst) != 0 {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    let host = cpal::default_host();
    let device = host.default_output_device().ok_or("no output device")?;

    let track_rate = state.sample_rate.load(Ordering::SeqCst);
    let track_channels = state.channels.load(Ordering::SeqCst).max(1) as u16;

    // Check if device supports the track's rate + channels + f32 format
    let device_supports_track = device
        .supported_output_configs()
        .map(|configs| {
            configs.into_iter().any(|range| {
                range.sample_format() == cpal::SampleFormat::F32
                    && range.channels() >= track_channels
                    && range.min_sample_rate().0 <= track_rate
                    && range.max_sample_rate().0 >= track_rate
            })
        })
        .unwrap_or(false);

    let config: cpal::StreamConfig = if device_supports_track {
        cpal::StreamConfig {
            channels: track_channels,
            sample_rate: cpal::SampleRate(track_rate),
            buffer_size: cpal::BufferSize::Default,
        }
    } else {
        // Verify default config supports f32
        let default_cfg = device.default_output_config()?;
        if default_cfg.sample_format() != cpal::SampleFormat::F32 {
            return Err(format!(
                "device does not support f32 output (got {:?})",
                default_cfg.sample_format()
            )
            .into());
        }
        default_cfg.into()
    };

    let out_channels = config.channels;
    state.output_channels.store(out_channels as u32, Ordering::SeqCst);

    let cb_state = Arc::clone(&state);
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let audible = cb_state.play_when_ready.load(Ordering::SeqCst)
                && cb_state.status.load(Ordering::SeqCst) == READY;
            if !audible {
                data.fill(0.0);
                return;
            }
            let ring_ch = cb_state.channels.load(Ordering::SeqCst).max(1) as u16;
            let (pulled, wanted) = if ring_ch == out_channels || out_channels == 0 {
                // Channels match; pull directly
                (cb_state.samples.lock().pull(data), data.len())
            } else {
                // Channel mismatch; pull at ring's channel count, adapt
                let frames = data.len() / out_channels as usize;
                let ring_samples = frames * ring_ch as usize;
                let mut tmp = vec![0.0f32; ring_samples];
                let pulled = cb_state.samples.lock().pull(&mut tmp);
                adapt_channels(&tmp, ring_ch, data, out_channels);
                (pulled, ring_samples)
            };
            // Starved while more audio is coming: back to buffering.
            if pulled < wanted && !cb_state.decode_done.load(Ordering::SeqCst) {
                cb_state.transition(READY, BUFFERING);
            }
            let vol = cb_state.volume.load(Ordering::SeqCst) as f32 / 100.0;
            for s in data.iter_mut() {
                *s *= vol;
            }
        },
        move |err| {
            log::error!("reprise: cpal error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    // Publishing the rate releases the decoder.
    state.device_rate.store(config.sample_rate.0, Ordering::SeqCst);

    // Keep stream alive until stopped; mark the end once the last loop drained.
    while !state.stopped() {
        if state.decode_done.load(Ordering::SeqCst) && state.samples.lock().len == 0 {
            state.transition(READY, ENDED);
        }
        thread::sleep(Duration::from_millis(25));
    }

    Ok(())
}

/// Remix interleaved frames from the clip's channel count to the device's.
/// Mono clips are copied to every output channel, downmixes to mono
/// average, and any other layout keeps the leading channels.
fn adapt_channels(src: &[f32], src_ch: u16, dst: &mut [f32], dst_ch: u16) {
    let (src_ch, dst_ch) = (src_ch as usize, dst_ch as usize);
    let frames = src.chunks(src_ch).chain(std::iter::repeat(&[] as &[f32]));
    for (out, frame) in dst.chunks_exact_mut(dst_ch).zip(frames) {
        match (src_ch, dst_ch) {
            (1, _) => out.fill(frame.first().copied().unwrap_or(0.0)),
            (_, 1) if !frame.is_empty() => out[0] = frame.iter().sum::<f32>() / frame.len() as f32,
            _ => {
                for (c, sample) in out.iter_mut().enumerate() {
                    *sample = frame.get(c).copied().unwrap_or(0.0);
                }
            }
        }
    }
}
