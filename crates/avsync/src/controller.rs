//! Sync controller: playback state machine, master clock and outward events.
//!
//! A control thread reacts to three inputs:
//! - item events (opened, failed, bitrate changes)
//! - the doorbell, rung by every queue whenever its occupancy changes
//! - a periodic tick, so time-based decisions (countdowns, end of media) still happen
//!   when no queue moves
//!
//! Render threads pull frames through the [`RenderSource`] implementation and report
//! presented times back; with an audio stream the audio presentation time is the time
//! of record, otherwise the clock runs on the wall clock at the playback rate.
//!
//! Lock order: `seek_lock` before `playback`, `playback` before `clock` and before either
//! sink. No lock but `seek_lock` is held while waiting on the demuxer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use avsync_types::{LoadingState, PlaybackEndReason, PlayerEvent, PlayerState, PlayerStatus};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};

use crate::clock::MediaClock;
use crate::config::PlayerConfig;
use crate::events::EventBus;
use crate::filter::chain::with_tempo;
use crate::frame::{AudioFrame, MediaKind, VideoFrame};
use crate::item::{ItemEvent, ItemStreams, PlayerItem};
use crate::live_rate::LiveRatePolicy;
use crate::sink::{
    AudioPump, AudioSink, FrameOutput, RefreshDriver, RenderSource, SharedAudioSink,
    SharedVideoOutput, VideoOutput,
};
use crate::source::Demuxer;
use crate::subtitle::{SubtitlePart, SubtitleTimeline};

const CONTROL_TICK: Duration = Duration::from_millis(20);
/// A video frame is shown once the clock is within this many seconds of its pts.
const PRESENT_LEAD: f64 = 0.005;
/// Embedded subtitle parts that ended this long ago are discarded.
const SUBTITLE_RETENTION: f64 = 5.0;

/// Handle to a player. Dropping it stops playback and joins every thread.
pub struct SyncController {
    core: Arc<Core>,
    shutdown: Option<Sender<()>>,
    control: Option<JoinHandle<()>>,
    render: Mutex<Option<(RefreshDriver, AudioPump)>>,
    /// Serializes seeks and track switches.
    seek_lock: Mutex<()>,
}

struct Core {
    playback: Mutex<Playback>,
    clock: Mutex<MediaClock>,
    video: SharedVideoOutput,
    audio: SharedAudioSink,
    bus: EventBus,
    item_tx: Sender<ItemEvent>,
    doorbell_tx: Sender<()>,
    /// Show the front video frame regardless of timing (first frame, after a seek).
    redraw: AtomicBool,
    dropped_video: AtomicU64,
    /// Parts loaded from sidecar files; never pruned.
    sidecar: Mutex<SubtitleTimeline>,
}

/// Everything the state machine owns. Guarded by one mutex so that a status snapshot is
/// always consistent.
struct Playback {
    config: PlayerConfig,
    state: PlayerState,
    playing: bool,
    outputs_running: bool,
    item: Option<Arc<PlayerItem>>,
    /// The item reported its media info.
    opened: bool,
    duration: f64,
    rate: f64,
    is_first: bool,
    is_seek: bool,
    /// A seek is waiting on the demuxer; buffering is not evaluated meanwhile.
    seek_pending: bool,
    loop_count: u32,
    playable_time: f64,
    buffering_progress: u8,
    end_reason: Option<PlaybackEndReason>,
    error: Option<String>,
    loading: Option<LoadingState>,
    live_rate: LiveRatePolicy,
    countdown: Option<Countdown>,
}

struct Countdown {
    deadline: Instant,
    done: Sender<()>,
}

impl SyncController {
    /// Build a controller and start its control thread. No media is opened until
    /// [`SyncController::prepare`].
    pub fn new(config: PlayerConfig, audio_sink: Box<dyn AudioSink>) -> Result<Self> {
        let config = config.normalized();
        let (item_tx, item_rx) = unbounded();
        let (doorbell_tx, doorbell_rx) = bounded(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let core = Arc::new(Core {
            clock: Mutex::new(MediaClock::new(config.start_time)),
            video: Arc::new(Mutex::new(VideoOutput::new(config.video_output.prefer_compositor))),
            audio: Arc::new(Mutex::new(audio_sink)),
            bus: EventBus::new(),
            item_tx,
            doorbell_tx,
            redraw: AtomicBool::new(false),
            dropped_video: AtomicU64::new(0),
            sidecar: Mutex::new(SubtitleTimeline::new()),
            playback: Mutex::new(Playback {
                live_rate: LiveRatePolicy::new(config.live_rate.clone()),
                config,
                state: PlayerState::Idle,
                playing: false,
                outputs_running: false,
                item: None,
                opened: false,
                duration: 0.0,
                rate: 1.0,
                is_first: true,
                is_seek: false,
                seek_pending: false,
                loop_count: 0,
                playable_time: 0.0,
                buffering_progress: 0,
                end_reason: None,
                error: None,
                loading: None,
                countdown: None,
            }),
        });

        let control_core = core.clone();
        let control = thread::Builder::new()
            .name("avsync-control".into())
            .spawn(move || control_core.run(item_rx, doorbell_rx, shutdown_rx))
            .context("spawn control thread")?;

        Ok(Self {
            core,
            shutdown: Some(shutdown_tx),
            control: Some(control),
            render: Mutex::new(None),
            seek_lock: Mutex::new(()),
        })
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        self.core.bus.subscribe()
    }

    /// Open `demuxer` and start buffering: `idle → preparing`.
    pub fn prepare(&self, demuxer: Box<dyn Demuxer>) -> Result<()> {
        let mut pb = self.core.playback();
        if pb.state != PlayerState::Idle {
            bail!("prepare requires an idle player, state is {:?}", pb.state);
        }
        let item = Arc::new(PlayerItem::new(
            demuxer,
            &pb.config,
            self.core.item_tx.clone(),
            self.core.doorbell_tx.clone(),
        ));
        item.prepare()?;
        pb.item = Some(item);
        pb.is_first = true;
        self.core.redraw.store(true, Ordering::Release);
        self.core.set_state(&mut pb, PlayerState::Preparing);
        Ok(())
    }

    /// Start the display-refresh and audio threads that drain the frame queues.
    ///
    /// Hosts that drive rendering themselves use [`SyncController::render_source`]
    /// instead.
    pub fn start_render(&self) -> Result<()> {
        let mut render = self.render.lock().unwrap();
        if render.is_some() {
            return Ok(());
        }
        let refresh_hz = self.core.playback().config.video_output.refresh_hz;
        let source = self.render_source();
        let refresh = RefreshDriver::spawn(source.clone(), self.core.video.clone(), refresh_hz)?;
        let pump = AudioPump::spawn(source, self.core.audio.clone())?;
        *render = Some((refresh, pump));
        Ok(())
    }

    pub fn render_source(&self) -> Arc<dyn RenderSource> {
        self.core.clone()
    }

    pub fn video_output(&self) -> SharedVideoOutput {
        self.core.video.clone()
    }

    pub fn audio_sink(&self) -> SharedAudioSink {
        self.core.audio.clone()
    }

    pub fn play(&self) {
        let mut pb = self.core.playback();
        pb.playing = true;
        self.core.apply_outputs(&mut pb);
    }

    pub fn pause(&self) {
        let mut pb = self.core.playback();
        pb.playing = false;
        self.core.apply_outputs(&mut pb);
    }

    /// Seek to `time` seconds. Returns `false` when the seek could not be performed; the
    /// player is then left exactly as it was.
    pub fn seek(&self, time: f64) -> bool {
        match self.reposition(Some(time), None) {
            Ok(target) => {
                tracing::info!(target, "seek");
                true
            }
            Err(e) => {
                tracing::warn!(time, "seek failed: {e:#}");
                false
            }
        }
    }

    /// Decode stream `index` instead of the current stream of its kind, continuing from
    /// the current time. On failure the previous stream keeps playing.
    pub fn select_track(&self, index: usize) -> Result<()> {
        let at = self.reposition(None, Some(index))?;
        tracing::info!(index, at, "track switched");
        Ok(())
    }

    /// Seek to `time` (the current time when `None`), switching to stream `track` on the
    /// way. Returns the position playback restarts from.
    fn reposition(&self, time: Option<f64>, track: Option<usize>) -> Result<f64> {
        let _seek = self.seek_lock.lock().unwrap();
        let (item, target, previous) = {
            let mut pb = self.core.playback();
            let Some(item) = pb.item.clone() else {
                bail!("no item prepared");
            };
            let Some(streams) = item.streams() else {
                bail!("item not opened yet");
            };
            if matches!(pb.state, PlayerState::Idle | PlayerState::Stopped)
                || pb.end_reason == Some(PlaybackEndReason::Error)
            {
                bail!("cannot seek in state {:?}", pb.state);
            }

            let target = match time {
                Some(time) => {
                    let mut target = if time.is_finite() { time.max(0.0) } else { 0.0 };
                    if pb.duration > 0.0 && target >= pb.duration && pb.config.loop_play {
                        target = 0.0;
                    }
                    target
                }
                None => self.core.clock.lock().unwrap().time(),
            };
            if let Some(index) = track {
                let kind = streams
                    .info()
                    .streams
                    .iter()
                    .find(|s| s.index == index)
                    .map(|s| s.kind)
                    .ok_or_else(|| anyhow!("no stream {index}"))?;
                match streams.selected(kind) {
                    Some(selected) if selected == index => return Ok(target),
                    Some(_) => {}
                    None => bail!("no {kind} pipeline to switch"),
                }
            }

            let previous = pb.state;
            pb.seek_pending = true;
            self.core.set_state(&mut pb, PlayerState::Seeking);
            (item, target, previous)
        };

        // The read thread may be inside a slow read holding the demuxer.
        let result = match track {
            Some(index) => item.select_track(index, target),
            None => item.seek(target),
        };

        let mut pb = self.core.playback();
        pb.seek_pending = false;
        let same_item = pb.item.as_ref().is_some_and(|current| Arc::ptr_eq(current, &item));
        if !same_item || pb.state != PlayerState::Seeking {
            bail!("player moved on to {:?} while seeking", pb.state);
        }
        match result {
            Ok(()) => {
                self.core.restart_at(&mut pb, target);
                pb.end_reason = None;
                self.core.set_progress(&mut pb, 0);
                Ok(target)
            }
            Err(e) => {
                self.core.set_state(&mut pb, previous);
                Err(e)
            }
        }
    }

    /// Stop playback and release the item: `* → stopped`.
    pub fn stop(&self) {
        if let Some((mut refresh, mut pump)) = self.render.lock().unwrap().take() {
            refresh.stop();
            pump.stop();
        }
        let item = {
            let mut pb = self.core.playback();
            if pb.state == PlayerState::Stopped {
                return;
            }
            pb.playing = false;
            if !pb.state.is_terminal() {
                pb.end_reason = Some(PlaybackEndReason::Stopped);
            }
            pb.countdown = None;
            self.core.set_state(&mut pb, PlayerState::Stopped);
            pb.item.take()
        };
        if let Some(item) = item {
            item.stop();
        }
        self.core.flush_outputs();
        tracing::info!("stopped");
    }

    /// Release the item and return to `idle`, ready for another
    /// [`SyncController::prepare`]. Config, rate and sidecar subtitles are kept; render
    /// threads must be started again.
    pub fn reset(&self) {
        if self.state() != PlayerState::Idle {
            self.stop();
        }
        let mut pb = self.core.playback();
        pb.playing = false;
        pb.item = None;
        pb.opened = false;
        pb.duration = 0.0;
        pb.is_first = true;
        pb.is_seek = false;
        pb.loop_count = 0;
        pb.playable_time = 0.0;
        pb.buffering_progress = 0;
        pb.end_reason = None;
        pb.error = None;
        pb.loading = None;
        pb.countdown = None;
        pb.live_rate.reset();
        self.core.clock.lock().unwrap().set(pb.config.start_time);
        self.core.dropped_video.store(0, Ordering::Relaxed);
        self.core.redraw.store(false, Ordering::Release);
        self.core.set_state(&mut pb, PlayerState::Idle);
        tracing::info!("reset");
    }

    /// Change the playback rate. Audio keeps its pitch through an `atempo` filter.
    pub fn set_playback_rate(&self, rate: f64) -> Result<()> {
        if !rate.is_finite() || rate <= 0.0 {
            bail!("invalid playback rate {rate}");
        }
        let mut pb = self.core.playback();
        pb.live_rate.reset();
        self.core.apply_rate(&mut pb, rate);
        Ok(())
    }

    pub fn set_audio_filters(&self, filters: Vec<String>) {
        let mut pb = self.core.playback();
        pb.config.audio_filters = filters;
        let rate = pb.rate;
        self.core.apply_rate(&mut pb, rate);
    }

    pub fn set_video_filters(&self, filters: Vec<String>) {
        let mut pb = self.core.playback();
        pb.config.video_filters = filters;
        let chain = pb.config.video_chain();
        if let Some(item) = &pb.item {
            item.set_chain(MediaKind::Video, &chain);
        }
    }

    pub fn set_forward_buffer_duration(&self, seconds: f64) {
        let mut pb = self.core.playback();
        pb.config.forward_buffer_duration = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    }

    pub fn set_loop_play(&self, enabled: bool) {
        self.core.playback().config.loop_play = enabled;
    }

    /// Returns a receiver that gets one message once the countdown elapses, or as soon
    /// as the player is playable. Starting a new countdown or cancelling disconnects the
    /// previous receiver without a message.
    pub fn buffering_countdown(&self, after: Duration) -> Receiver<()> {
        let (done, rx) = bounded(1);
        let mut pb = self.core.playback();
        if pb.state == PlayerState::Playable {
            pb.countdown = None;
            let _ = done.send(());
        } else {
            pb.countdown = Some(Countdown {
                deadline: Instant::now() + after,
                done,
            });
        }
        rx
    }

    pub fn cancel_buffering_countdown(&self) {
        self.core.playback().countdown = None;
    }

    /// Load sidecar subtitle parts (for example from [`crate::subtitle::parse_srt`]).
    pub fn add_subtitles(&self, parts: impl IntoIterator<Item = SubtitlePart>) {
        let mut sidecar = self.core.sidecar.lock().unwrap();
        for part in parts {
            sidecar.insert(part);
        }
    }

    /// Subtitle parts visible at `time`, embedded first.
    pub fn subtitles_at(&self, time: f64) -> Vec<SubtitlePart> {
        let streams = self.core.streams();
        let mut parts: Vec<SubtitlePart> = streams
            .as_ref()
            .and_then(|s| s.subtitles())
            .map(|t| t.lock().unwrap().parts_at(time).into_iter().cloned().collect())
            .unwrap_or_default();
        parts.extend(self.core.sidecar.lock().unwrap().parts_at(time).into_iter().cloned());
        parts
    }

    pub fn current_subtitles(&self) -> Vec<SubtitlePart> {
        self.subtitles_at(self.current_time())
    }

    pub fn state(&self) -> PlayerState {
        self.core.playback().state
    }

    pub fn current_time(&self) -> f64 {
        let _pb = self.core.playback();
        self.core.clock.lock().unwrap().time()
    }

    /// Most recent loading snapshot, once the item has opened.
    pub fn loading_state(&self) -> Option<LoadingState> {
        self.core.playback().loading.clone()
    }

    pub fn streams(&self) -> Option<Arc<ItemStreams>> {
        self.core.streams()
    }

    pub fn status(&self) -> PlayerStatus {
        let pb = self.core.playback();
        let clock = self.core.clock.lock().unwrap();
        PlayerStatus {
            state: pb.state,
            playing: pb.playing,
            current_time: clock.time(),
            playable_time: pb.playable_time,
            duration: pb.duration,
            rate: pb.rate,
            buffering_progress: pb.buffering_progress,
            loop_count: pb.loop_count,
            dropped_video_frames: self.core.dropped_video.load(Ordering::Relaxed),
            end_reason: pb.end_reason,
            error: pb.error.clone(),
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.stop();
        self.shutdown.take();
        if let Some(control) = self.control.take() {
            if control.join().is_err() {
                tracing::error!("control thread panicked");
            }
        }
    }
}

impl Core {
    fn playback(&self) -> MutexGuard<'_, Playback> {
        self.playback.lock().unwrap()
    }

    fn streams(&self) -> Option<Arc<ItemStreams>> {
        self.playback().item.as_ref().and_then(|item| item.streams())
    }

    fn run(&self, items: Receiver<ItemEvent>, doorbell: Receiver<()>, shutdown: Receiver<()>) {
        let ticker = tick(CONTROL_TICK);
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(items) -> event => {
                    if let Ok(event) = event {
                        self.on_item_event(event);
                    }
                }
                recv(doorbell) -> _ => self.on_source_change(),
                recv(ticker) -> _ => {
                    self.on_source_change();
                    self.on_tick();
                }
            }
        }
        tracing::debug!("control thread exiting");
    }

    fn on_item_event(&self, event: ItemEvent) {
        match event {
            ItemEvent::Opened(info) => {
                let mut pb = self.playback();
                pb.duration = if info.duration.is_finite() { info.duration.max(0.0) } else { 0.0 };
                pb.opened = true;
                tracing::info!(
                    duration = pb.duration,
                    audio = info.first(MediaKind::Audio).is_some(),
                    "item ready for buffering"
                );
            }
            ItemEvent::Failed(error) => self.fail(error),
            ItemEvent::BitrateChanged { old, new } => {
                self.bus.publish(PlayerEvent::BitrateChanged { old, new });
            }
        }
    }

    /// Re-evaluate buffering after any occupancy change.
    fn on_source_change(&self) {
        let mut pb = self.playback();
        if !pb.opened
            || pb.seek_pending
            || !matches!(
                pb.state,
                PlayerState::Preparing
                    | PlayerState::Loading
                    | PlayerState::Playable
                    | PlayerState::Seeking
            )
        {
            return;
        }
        let Some(item) = pb.item.clone() else {
            return;
        };
        let Some(streams) = item.streams() else {
            return;
        };

        let loading = loading_state(&pb, &item, &streams);
        let now = self.clock.lock().unwrap().time();
        pb.playable_time = if loading.is_end_of_file {
            pb.duration.max(now)
        } else {
            now + loading.loaded_time
        };
        self.publish_loading(&mut pb, &loading);

        if pb.state == PlayerState::Playable {
            if !loading.is_end_of_file
                && loading.frame_count == 0
                && loading.packet_count == 0
                && pb.config.forward_buffer_duration != 0.0
            {
                self.set_state(&mut pb, PlayerState::Loading);
                if pb.playing {
                    self.set_progress(&mut pb, 0);
                }
            } else if loading.is_end_of_file && is_consumed(&item, &streams) {
                self.end_of_media(&mut pb, &item);
            }
        } else if loading.is_playable {
            let first = pb.is_first;
            pb.is_first = false;
            pb.is_seek = false;
            self.set_state(&mut pb, PlayerState::Playable);
            if first {
                self.bus.publish(PlayerEvent::ReadyToPlay { duration: pb.duration });
            }
            if pb.playing {
                self.set_progress(&mut pb, 100);
            }
            if let Some(countdown) = pb.countdown.take() {
                let _ = countdown.done.send(());
            }
        } else if pb.playing {
            self.set_progress(&mut pb, loading.buffering_percent());
        }

        if pb.duration == 0.0 && pb.playing && pb.state == PlayerState::Playable {
            if let Some(rate) = pb.live_rate.update(loading.loaded_time) {
                self.apply_rate(&mut pb, rate);
            }
        }
    }

    fn on_tick(&self) {
        let mut pb = self.playback();
        if pb
            .countdown
            .as_ref()
            .is_some_and(|c| Instant::now() >= c.deadline)
        {
            if let Some(countdown) = pb.countdown.take() {
                tracing::debug!("buffering countdown elapsed");
                let _ = countdown.done.send(());
            }
        }

        let now = self.clock.lock().unwrap().time();
        drop(pb);
        if let Some(timeline) = self.streams().as_ref().and_then(|s| s.subtitles()) {
            timeline.lock().unwrap().prune_before(now - SUBTITLE_RETENTION);
        }
    }

    /// End of input reached and every frame consumed.
    fn end_of_media(&self, pb: &mut Playback, item: &PlayerItem) {
        if pb.config.loop_play {
            match item.seek(0.0) {
                Ok(()) => {
                    pb.loop_count += 1;
                    tracing::info!(loop_count = pb.loop_count, "loop completed");
                    self.bus.publish(PlayerEvent::LoopCompleted { count: pb.loop_count });
                    self.set_state(pb, PlayerState::Loading);
                    self.restart_at(pb, 0.0);
                    return;
                }
                Err(e) => tracing::warn!("loop restart failed: {e:#}"),
            }
        }
        pb.end_reason = Some(PlaybackEndReason::Eof);
        self.set_state(pb, PlayerState::Finished);
        tracing::info!("playback finished");
        self.bus.publish(PlayerEvent::Finished { error: None });
    }

    /// Common tail of a successful seek: reset the clock and clear what was on screen.
    fn restart_at(&self, pb: &mut Playback, time: f64) {
        pb.is_seek = true;
        pb.live_rate.reset();
        self.clock.lock().unwrap().set(time);
        self.flush_outputs();
        self.redraw.store(true, Ordering::Release);
    }

    fn fail(&self, error: String) {
        let item = {
            let mut pb = self.playback();
            if pb.state.is_terminal() {
                return;
            }
            tracing::error!("playback failed: {error}");
            pb.end_reason = Some(PlaybackEndReason::Error);
            pb.error = Some(error.clone());
            pb.countdown = None;
            self.set_state(&mut pb, PlayerState::Finished);
            self.bus.publish(PlayerEvent::Finished { error: Some(error) });
            pb.item.clone()
        };
        if let Some(item) = item {
            item.stop();
        }
        self.flush_outputs();
    }

    fn set_state(&self, pb: &mut Playback, to: PlayerState) {
        let from = pb.state;
        if from == to {
            return;
        }
        pb.state = to;
        tracing::debug!(?from, ?to, "state");
        self.bus.publish(PlayerEvent::StateChanged { from, to });
        self.apply_outputs(pb);
    }

    /// Run the sinks and clock only while playback is requested and media is playable.
    fn apply_outputs(&self, pb: &mut Playback) {
        let rendering = pb.playing && pb.state == PlayerState::Playable;
        if rendering == pb.outputs_running {
            return;
        }
        pb.outputs_running = rendering;
        let mut clock = self.clock.lock().unwrap();
        if rendering {
            self.video.lock().unwrap().play();
            self.audio.lock().unwrap().play();
            clock.resume();
        } else {
            self.video.lock().unwrap().pause();
            self.audio.lock().unwrap().pause();
            clock.pause();
        }
    }

    fn flush_outputs(&self) {
        self.video.lock().unwrap().flush();
        self.audio.lock().unwrap().flush();
    }

    fn apply_rate(&self, pb: &mut Playback, rate: f64) {
        pb.rate = rate;
        self.clock.lock().unwrap().set_rate(rate);
        let chain = with_tempo(&pb.config.audio_chain(), rate);
        if let Some(item) = &pb.item {
            item.set_chain(MediaKind::Audio, &chain);
        }
    }

    fn set_progress(&self, pb: &mut Playback, percent: u8) {
        if pb.buffering_progress != percent {
            pb.buffering_progress = percent;
            self.bus.publish(PlayerEvent::BufferingProgress { percent });
        }
    }

    /// Publish a loading snapshot when any of its flags, or queue emptiness, changed.
    fn publish_loading(&self, pb: &mut Playback, loading: &LoadingState) {
        let key = |l: &LoadingState| {
            (
                l.is_first,
                l.is_seek,
                l.is_playable,
                l.is_end_of_file,
                l.frame_count == 0,
                l.packet_count == 0,
            )
        };
        let changed = pb.loading.as_ref().is_none_or(|last| key(last) != key(loading));
        pb.loading = Some(loading.clone());
        if changed {
            self.bus.publish(PlayerEvent::LoadingStateChanged { loading: loading.clone() });
        }
    }

    fn is_rendering(&self) -> bool {
        self.playback().outputs_running
    }
}

/// Occupancy snapshot of the active audio/video streams.
fn loading_state(pb: &Playback, item: &PlayerItem, streams: &ItemStreams) -> LoadingState {
    let serial = item.serial();
    let eof = item.is_eof();
    let active: Vec<_> = streams
        .active()
        .map(|p| (p.occupancy(), p.is_drained(serial)))
        .collect();

    let frame_count = active.iter().map(|(o, _)| o.frames.count).min().unwrap_or(0);
    let packet_count = active.iter().map(|(o, _)| o.packets.count).min().unwrap_or(0);
    let loaded_time = active
        .iter()
        .map(|(o, _)| o.loaded_time())
        .reduce(f64::min)
        .unwrap_or(0.0);
    let full = active.iter().any(|(o, _)| o.frames_full);
    let ready = active
        .iter()
        .all(|(o, drained)| *drained || o.frames.count >= pb.config.min_start_frames);

    let forward = pb.config.forward_buffer_duration;
    let is_playable = ready && (pb.is_first || pb.is_seek || eof || full || loaded_time >= forward);

    LoadingState {
        is_first: pb.is_first,
        is_seek: pb.is_seek,
        is_playable,
        is_end_of_file: eof,
        frame_count,
        packet_count,
        loaded_time,
        progress: loaded_time / forward * 100.0,
    }
}

/// Every active stream is drained and its queues are empty.
fn is_consumed(item: &PlayerItem, streams: &ItemStreams) -> bool {
    let serial = item.serial();
    streams.active().all(|p| {
        let occ = p.occupancy();
        p.is_drained(serial) && occ.frames.count == 0 && occ.packets.count == 0
    })
}

impl RenderSource for Core {
    fn next_video_frame(&self, force: bool) -> Option<VideoFrame> {
        let streams = self.streams()?;
        let queue = streams.video_frames()?;

        if force || self.redraw.load(Ordering::Acquire) {
            let frame = queue.pop()?;
            self.redraw.store(false, Ordering::Release);
            return Some(frame);
        }
        if !self.is_rendering() {
            return None;
        }
        let now = self.clock.lock().unwrap().time();
        let (frame, dropped) = queue.pop_through(now + PRESENT_LEAD);
        if dropped > 0 {
            self.dropped_video.fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::debug!(dropped, clock = now, "late video frames dropped");
        }
        frame
    }

    fn next_audio_frame(&self) -> Option<AudioFrame> {
        if !self.is_rendering() {
            return None;
        }
        self.streams()?.audio_frames()?.pop()
    }

    fn set_presented(&self, kind: MediaKind, time: f64, position: u64) {
        tracing::trace!(%kind, time, position, "presented");
        let pb = self.playback();
        if kind == MediaKind::Audio && pb.outputs_running {
            self.clock.lock().unwrap().set(time);
        }
    }

    fn rate(&self) -> f64 {
        self.playback().rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Packet, PixelFormat};
    use crate::sink::MeterSink;
    use crate::source::{Decoded, Decoder, MediaInfo, StreamInfo};
    use crate::timebase::Timebase;

    /// Video-only source of 25 fps gray frames.
    struct Pictures {
        count: i64,
        next: i64,
        seekable: bool,
        corrupt_at: Option<i64>,
    }

    impl Pictures {
        fn new(count: i64) -> Self {
            Self { count, next: 0, seekable: true, corrupt_at: None }
        }
    }

    struct Gray;

    impl Decoder for Gray {
        fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
            if packet.payload.is_empty() {
                bail!("bitstream error");
            }
            Ok(vec![Decoded::Frame(Frame::Video(VideoFrame::new(
                packet.pts_seconds(),
                packet.duration_seconds(),
                PixelFormat::Gray8,
                2,
                2,
                vec![0; 4],
            )))])
        }
    }

    impl Demuxer for Pictures {
        fn open(&mut self) -> Result<MediaInfo> {
            let mut stream = StreamInfo::new(0, MediaKind::Video, Timebase::new(1, 25));
            stream.frame_rate = Some(25.0);
            Ok(MediaInfo {
                streams: vec![stream],
                duration: self.count as f64 / 25.0,
                bitrate: None,
            })
        }

        fn read_packet(&mut self) -> Result<Option<Packet>> {
            if self.next >= self.count {
                return Ok(None);
            }
            let ts = self.next;
            self.next += 1;
            let payload = if self.corrupt_at == Some(ts) { vec![] } else { vec![1] };
            Ok(Some(Packet {
                stream_index: 0,
                timestamp: ts,
                duration: 1,
                timebase: Timebase::new(1, 25),
                keyframe: true,
                payload,
            }))
        }

        fn seek(&mut self, seconds: f64) -> Result<()> {
            if !self.seekable {
                bail!("stream is not seekable");
            }
            self.next = (seconds * 25.0).round() as i64;
            Ok(())
        }

        fn decoder(&mut self, _stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
            Ok(Box::new(Gray))
        }
    }

    fn controller(config: PlayerConfig) -> SyncController {
        SyncController::new(config, Box::new(MeterSink::new())).unwrap()
    }

    fn wait_for(ctl: &SyncController, state: PlayerState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if ctl.state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn prepare_reaches_playable_and_announces_ready() {
        let ctl = controller(PlayerConfig::default());
        let events = ctl.subscribe();
        ctl.prepare(Box::new(Pictures::new(10))).unwrap();
        assert!(wait_for(&ctl, PlayerState::Playable));

        let seen: Vec<_> = events.try_iter().collect();
        assert!(seen.contains(&PlayerEvent::StateChanged {
            from: PlayerState::Idle,
            to: PlayerState::Preparing
        }));
        assert!(seen.contains(&PlayerEvent::ReadyToPlay { duration: 0.4 }));
        assert!(ctl.prepare(Box::new(Pictures::new(1))).is_err());
    }

    #[test]
    fn seek_on_unseekable_source_restores_state() {
        let mut source = Pictures::new(10);
        source.seekable = false;
        let ctl = controller(PlayerConfig::default());
        ctl.prepare(Box::new(source)).unwrap();
        assert!(wait_for(&ctl, PlayerState::Playable));
        let streams = ctl.streams().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !streams.video().unwrap().is_drained(0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let before = streams.video().unwrap().occupancy();

        assert!(!ctl.seek(0.2));
        assert_eq!(ctl.state(), PlayerState::Playable);
        assert_eq!(before.frames.count, 10);
        assert_eq!(streams.video().unwrap().occupancy().frames, before.frames);
    }

    #[test]
    fn seek_before_prepare_fails() {
        let ctl = controller(PlayerConfig::default());
        assert!(!ctl.seek(1.0));
        assert_eq!(ctl.state(), PlayerState::Idle);
    }

    #[test]
    fn negative_seek_clamps_to_zero() {
        let ctl = controller(PlayerConfig::default());
        ctl.prepare(Box::new(Pictures::new(10))).unwrap();
        assert!(wait_for(&ctl, PlayerState::Playable));
        assert!(ctl.seek(-3.0));
        assert_eq!(ctl.current_time(), 0.0);
    }

    #[test]
    fn seek_resets_buffering_progress() {
        let ctl = controller(PlayerConfig::default());
        let events = ctl.subscribe();
        ctl.prepare(Box::new(Pictures::new(50))).unwrap();
        ctl.play();
        assert!(wait_for(&ctl, PlayerState::Playable));
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctl.status().buffering_progress != 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ctl.status().buffering_progress, 100);
        events.try_iter().for_each(drop);

        assert!(ctl.seek(1.0));
        let seen: Vec<_> = events.try_iter().collect();
        let seeking = seen
            .iter()
            .position(|e| matches!(e, PlayerEvent::StateChanged { to: PlayerState::Seeking, .. }))
            .unwrap();
        assert!(seen[seeking..].contains(&PlayerEvent::BufferingProgress { percent: 0 }));
    }

    #[test]
    fn reset_returns_to_idle_for_another_item() {
        let mut source = Pictures::new(10);
        source.corrupt_at = Some(3);
        let ctl = controller(PlayerConfig::default());
        ctl.prepare(Box::new(source)).unwrap();
        assert!(wait_for(&ctl, PlayerState::Finished));
        assert!(ctl.prepare(Box::new(Pictures::new(5))).is_err());

        ctl.reset();
        let status = ctl.status();
        assert_eq!(status.state, PlayerState::Idle);
        assert_eq!(status.loop_count, 0);
        assert_eq!(status.duration, 0.0);
        assert_eq!(status.current_time, 0.0);
        assert_eq!(status.buffering_progress, 0);
        assert!(status.end_reason.is_none());
        assert!(status.error.is_none());
        assert!(ctl.streams().is_none());
        assert!(ctl.loading_state().is_none());

        let events = ctl.subscribe();
        ctl.prepare(Box::new(Pictures::new(5))).unwrap();
        assert!(wait_for(&ctl, PlayerState::Playable));
        assert!(events.try_iter().any(|e| e == PlayerEvent::ReadyToPlay { duration: 0.2 }));

        ctl.reset();
        ctl.reset();
        assert_eq!(ctl.state(), PlayerState::Idle);
    }

    #[test]
    fn decode_error_finishes_with_error() {
        let mut source = Pictures::new(10);
        source.corrupt_at = Some(3);
        let ctl = controller(PlayerConfig::default());
        let events = ctl.subscribe();
        ctl.prepare(Box::new(source)).unwrap();
        assert!(wait_for(&ctl, PlayerState::Finished));

        let status = ctl.status();
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Error));
        assert!(status.error.unwrap().contains("bitstream error"));
        let finished = events
            .try_iter()
            .find(|e| matches!(e, PlayerEvent::Finished { .. }));
        assert!(matches!(finished, Some(PlayerEvent::Finished { error: Some(_) })));
        assert!(!ctl.seek(0.0));
    }

    #[test]
    fn countdown_fires_immediately_when_playable() {
        let ctl = controller(PlayerConfig::default());
        ctl.prepare(Box::new(Pictures::new(10))).unwrap();
        assert!(wait_for(&ctl, PlayerState::Playable));
        let rx = ctl.buffering_countdown(Duration::from_secs(60));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn countdown_is_replaced_and_elapses() {
        let ctl = controller(PlayerConfig::default());
        let first = ctl.buffering_countdown(Duration::from_secs(60));
        let second = ctl.buffering_countdown(Duration::from_millis(30));
        assert_eq!(
            first.recv_timeout(Duration::from_millis(500)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
        assert!(second.recv_timeout(Duration::from_secs(1)).is_ok());

        let third = ctl.buffering_countdown(Duration::from_secs(60));
        ctl.cancel_buffering_countdown();
        assert_eq!(
            third.recv_timeout(Duration::from_millis(100)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn playback_rate_rewrites_audio_chain() {
        let mut config = PlayerConfig::default();
        config.audio_filters = vec!["volume=0.8".into()];
        let ctl = controller(config);
        ctl.prepare(Box::new(Pictures::new(10))).unwrap();
        ctl.set_playback_rate(1.5).unwrap();
        assert_eq!(ctl.status().rate, 1.5);
        let item = ctl.core.playback().item.clone().unwrap();
        assert_eq!(&*item.chain(MediaKind::Audio), "volume=0.8,atempo=1.5");

        ctl.set_playback_rate(1.0).unwrap();
        assert_eq!(&*item.chain(MediaKind::Audio), "volume=0.8");
        assert!(ctl.set_playback_rate(0.0).is_err());
        assert!(ctl.set_playback_rate(f64::NAN).is_err());
    }

    #[test]
    fn stop_is_terminal_and_idempotent() {
        let ctl = controller(PlayerConfig::default());
        ctl.prepare(Box::new(Pictures::new(100))).unwrap();
        assert!(wait_for(&ctl, PlayerState::Playable));
        ctl.stop();
        ctl.stop();
        let status = ctl.status();
        assert_eq!(status.state, PlayerState::Stopped);
        assert_eq!(status.end_reason, Some(PlaybackEndReason::Stopped));
        assert!(ctl.streams().is_none());
    }

    #[test]
    fn playing_to_the_end_finishes() {
        let mut config = PlayerConfig::default();
        config.video_output.refresh_hz = 200.0;
        let ctl = controller(config);
        let events = ctl.subscribe();
        ctl.prepare(Box::new(Pictures::new(5))).unwrap();
        ctl.start_render().unwrap();
        ctl.play();
        assert!(wait_for(&ctl, PlayerState::Finished));
        assert_eq!(ctl.status().end_reason, Some(PlaybackEndReason::Eof));
        assert!(events.try_iter().any(|e| e == PlayerEvent::Finished { error: None }));
        assert!(ctl.video_output().lock().unwrap().enqueued() >= 1);
    }
}
