//! A media item being played: demuxer, read thread and per-stream decode pipelines.
//!
//! The item owns every producer-side thread. It reports what it learns (opened, failed,
//! bitrate changes) on an [`ItemEvent`] channel and rings the doorbell whenever a queue's
//! occupancy changes; the controller decides what those mean for playback state.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::Sender;

use crate::config::PlayerConfig;
use crate::frame::MediaKind;
use crate::pipeline::{PipelineShared, StreamOutput, StreamPipeline};
use crate::queue::{
    AudioFrameQueue, OverflowPolicy, PacketQueue, PushOutcome, QueueLimits, TimedQueue,
    VideoFrameQueue,
};
use crate::source::{Demuxer, MediaInfo, StreamInfo};
use crate::subtitle::SubtitleTimeline;

/// How often the read thread re-checks for a seek or stop after end of input.
const EOF_POLL: Duration = Duration::from_millis(10);

/// Producer-side notifications for the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum ItemEvent {
    /// The demuxer opened and the decode pipelines are running.
    Opened(MediaInfo),
    /// Open, read or decode failed; the item cannot continue.
    Failed(String),
    BitrateChanged { old: u64, new: u64 },
}

/// The decode pipelines chosen for an opened item.
pub struct ItemStreams {
    info: MediaInfo,
    live: bool,
    audio: Option<StreamPipeline>,
    video: Option<StreamPipeline>,
    subtitle: Option<StreamPipeline>,
}

impl ItemStreams {
    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    /// Queues evict instead of blocking.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn audio(&self) -> Option<&StreamPipeline> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&StreamPipeline> {
        self.video.as_ref()
    }

    pub fn subtitle(&self) -> Option<&StreamPipeline> {
        self.subtitle.as_ref()
    }

    pub fn audio_frames(&self) -> Option<&Arc<AudioFrameQueue>> {
        match self.audio.as_ref().map(StreamPipeline::output) {
            Some(StreamOutput::Audio(q)) => Some(q),
            _ => None,
        }
    }

    pub fn video_frames(&self) -> Option<&Arc<VideoFrameQueue>> {
        match self.video.as_ref().map(StreamPipeline::output) {
            Some(StreamOutput::Video(q)) => Some(q),
            _ => None,
        }
    }

    pub fn subtitles(&self) -> Option<&Arc<Mutex<SubtitleTimeline>>> {
        match self.subtitle.as_ref().map(StreamPipeline::output) {
            Some(StreamOutput::Subtitle(t)) => Some(t),
            _ => None,
        }
    }

    /// The pipeline decoding `kind`, if the item has one.
    pub fn pipeline(&self, kind: MediaKind) -> Option<&StreamPipeline> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
            MediaKind::Subtitle => self.subtitle.as_ref(),
        }
    }

    /// Every stream of `kind` the demuxer reported, selected or not.
    pub fn tracks(&self, kind: MediaKind) -> impl Iterator<Item = &StreamInfo> {
        self.info.streams.iter().filter(move |s| s.kind == kind)
    }

    /// Index of the stream currently decoded for `kind`.
    pub fn selected(&self, kind: MediaKind) -> Option<usize> {
        self.pipeline(kind).map(StreamPipeline::stream_index)
    }

    /// Audio and video pipelines; these gate playability.
    pub fn active(&self) -> impl Iterator<Item = &StreamPipeline> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn all(&self) -> impl Iterator<Item = &StreamPipeline> {
        self.active().chain(self.subtitle.iter())
    }

    fn route(&self, stream_index: usize) -> Option<&StreamPipeline> {
        self.all().find(|p| p.stream_index() == stream_index)
    }

    fn flush(&self, serial: u64) {
        for pipeline in self.all() {
            pipeline.flush(serial);
        }
    }
}

/// Handle to a playing item.
pub struct PlayerItem {
    demuxer: Arc<Mutex<Box<dyn Demuxer>>>,
    shared: Arc<PipelineShared>,
    streams: Arc<OnceLock<Arc<ItemStreams>>>,
    config: PlayerConfig,
    events: Sender<ItemEvent>,
    doorbell: Sender<()>,
    read: Mutex<Option<JoinHandle<()>>>,
}

impl PlayerItem {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        config: &PlayerConfig,
        events: Sender<ItemEvent>,
        doorbell: Sender<()>,
    ) -> Self {
        Self {
            demuxer: Arc::new(Mutex::new(demuxer)),
            shared: Arc::new(PipelineShared::new(&config.audio_chain(), &config.video_chain())),
            streams: Arc::new(OnceLock::new()),
            config: config.clone(),
            events,
            doorbell,
            read: Mutex::new(None),
        }
    }

    /// Start the read thread. It opens the demuxer, starts the decode pipelines and then
    /// reports [`ItemEvent::Opened`] or [`ItemEvent::Failed`].
    pub fn prepare(&self) -> Result<()> {
        let mut read = self.read.lock().unwrap();
        if read.is_some() {
            bail!("item already prepared");
        }
        let reader = Reader {
            demuxer: self.demuxer.clone(),
            shared: self.shared.clone(),
            streams: self.streams.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            doorbell: self.doorbell.clone(),
        };
        let handle = thread::Builder::new()
            .name("avsync-read".into())
            .spawn(move || reader.run())
            .context("spawn read thread")?;
        *read = Some(handle);
        Ok(())
    }

    pub fn streams(&self) -> Option<Arc<ItemStreams>> {
        self.streams.get().cloned()
    }

    pub fn serial(&self) -> u64 {
        self.shared.current_serial()
    }

    /// The demuxer reached end of input in the current generation.
    pub fn is_eof(&self) -> bool {
        self.shared.is_eof()
    }

    /// Reposition the demuxer and start a new generation.
    ///
    /// On failure nothing changes: queued packets and frames stay where they are.
    pub fn seek(&self, seconds: f64) -> Result<()> {
        self.reposition(seconds, None)
    }

    /// Decode stream `index` instead of the current stream of its kind, restarting at
    /// `seconds`. Selecting the current stream does nothing.
    ///
    /// On failure the previous stream keeps playing.
    pub fn select_track(&self, index: usize, seconds: f64) -> Result<()> {
        let streams = self.streams().ok_or_else(|| anyhow!("item not opened"))?;
        let stream = streams
            .info
            .streams
            .iter()
            .find(|s| s.index == index)
            .cloned()
            .ok_or_else(|| anyhow!("no stream {index}"))?;
        let Some(pipeline) = streams.pipeline(stream.kind) else {
            bail!("no {} pipeline to switch", stream.kind);
        };
        if pipeline.stream_index() == index {
            return Ok(());
        }
        let kind = stream.kind;
        self.reposition(seconds, Some(stream))?;
        tracing::info!(%kind, stream = index, at = seconds, "track selected");
        Ok(())
    }

    /// Seek the demuxer, optionally switching one pipeline to another stream, and start a
    /// new generation.
    fn reposition(&self, seconds: f64, track: Option<StreamInfo>) -> Result<()> {
        let streams = self.streams().ok_or_else(|| anyhow!("item not opened"))?;
        let mut demuxer = self.demuxer.lock().unwrap();
        let switch = match track {
            Some(stream) => {
                let decoder = demuxer
                    .decoder(&stream)
                    .with_context(|| format!("create {} decoder for stream {}", stream.kind, stream.index))?;
                Some((stream, decoder))
            }
            None => None,
        };
        demuxer
            .seek(seconds)
            .with_context(|| format!("seek to {seconds:.3}s"))?;

        // Seeks are the only writer and run under the demuxer lock.
        let serial = self.shared.current_serial() + 1;
        if let Some((stream, decoder)) = switch {
            if let Some(pipeline) = streams.pipeline(stream.kind) {
                pipeline.switch_to(serial, stream, decoder);
            }
        }
        self.shared.serial.store(serial, Ordering::Release);
        *self.shared.seek_target.lock().unwrap() = self.config.accurate_seek.then_some((serial, seconds));
        self.shared.eof_serial.store(0, Ordering::Release);
        streams.flush(serial);
        drop(demuxer);

        tracing::debug!(serial, target = seconds, "seeked");
        let _ = self.doorbell.try_send(());
        Ok(())
    }

    /// Replace the filter chain for audio or video; picked up on the next decoded frame.
    pub fn set_chain(&self, kind: MediaKind, chain: &str) {
        let slot = match kind {
            MediaKind::Audio => &self.shared.audio_chain,
            MediaKind::Video => &self.shared.video_chain,
            MediaKind::Subtitle => return,
        };
        *slot.lock().unwrap() = Arc::from(chain);
    }

    pub fn chain(&self, kind: MediaKind) -> Arc<str> {
        match kind {
            MediaKind::Video => self.shared.video_chain.lock().unwrap().clone(),
            _ => self.shared.audio_chain.lock().unwrap().clone(),
        }
    }

    /// Stop all threads and drop queued data. Safe to call more than once.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(streams) = self.streams() {
            for pipeline in streams.all() {
                pipeline.close();
            }
        }

        let read = self.read.lock().unwrap().take();
        if let Some(handle) = read {
            if handle.join().is_err() {
                tracing::error!("read thread panicked");
            }
        }
        // The read thread may have published streams while we were closing.
        if let Some(streams) = self.streams() {
            for pipeline in streams.all() {
                pipeline.close();
                pipeline.join();
            }
            streams.flush(self.shared.current_serial() + 1);
        }
    }
}

impl Drop for PlayerItem {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Reader {
    demuxer: Arc<Mutex<Box<dyn Demuxer>>>,
    shared: Arc<PipelineShared>,
    streams: Arc<OnceLock<Arc<ItemStreams>>>,
    config: PlayerConfig,
    events: Sender<ItemEvent>,
    doorbell: Sender<()>,
}

impl Reader {
    fn run(self) {
        let streams = match self.open() {
            Ok(streams) => streams,
            Err(e) => {
                tracing::error!("open failed: {e:#}");
                let _ = self.events.send(ItemEvent::Failed(format!("{e:#}")));
                return;
            }
        };
        if let Err(e) = self.read_loop(&streams) {
            tracing::error!("read failed: {e:#}");
            let _ = self.events.send(ItemEvent::Failed(format!("{e:#}")));
        }
        tracing::debug!("read thread exiting");
    }

    fn open(&self) -> Result<Arc<ItemStreams>> {
        let mut demuxer = self.demuxer.lock().unwrap();
        let info = demuxer.open().context("open media")?;
        let live = self.config.live.unwrap_or_else(|| info.is_live());
        let policy = if live {
            OverflowPolicy::DropOldest
        } else {
            OverflowPolicy::Block
        };
        tracing::info!(
            streams = info.streams.len(),
            duration = info.duration,
            live,
            "media opened"
        );

        let q = &self.config.queues;
        let packet_limits = QueueLimits::new(q.packet_max_items, q.packet_max_duration);
        let packet_queue = |label: &'static str| {
            Arc::new(TimedQueue::new(label, packet_limits, policy).with_doorbell(self.doorbell.clone()))
        };

        let audio = match info.first(MediaKind::Audio) {
            Some(stream) => {
                let frames = TimedQueue::new(
                    "audio-frames",
                    QueueLimits::new(q.audio_frame_max_items, q.frame_max_duration),
                    policy,
                )
                .with_doorbell(self.doorbell.clone());
                Some(self.spawn(
                    demuxer.as_mut(),
                    stream,
                    packet_queue("audio-packets"),
                    StreamOutput::Audio(Arc::new(frames)),
                )?)
            }
            None => None,
        };
        let video = match info.first(MediaKind::Video) {
            Some(stream) => {
                let frames = TimedQueue::new(
                    "video-frames",
                    QueueLimits::new(q.video_frame_max_items, q.frame_max_duration),
                    policy,
                )
                .with_doorbell(self.doorbell.clone());
                Some(self.spawn(
                    demuxer.as_mut(),
                    stream,
                    packet_queue("video-packets"),
                    StreamOutput::Video(Arc::new(frames)),
                )?)
            }
            None => None,
        };
        if audio.is_none() && video.is_none() {
            bail!("no audio or video stream");
        }
        let subtitle = match info.first(MediaKind::Subtitle) {
            Some(stream) if self.config.subtitles => {
                let output = StreamOutput::Subtitle(Arc::new(Mutex::new(SubtitleTimeline::new())));
                match self.spawn(demuxer.as_mut(), stream, packet_queue("subtitle-packets"), output) {
                    Ok(pipeline) => Some(pipeline),
                    Err(e) => {
                        tracing::warn!(stream = stream.index, "subtitles disabled: {e:#}");
                        None
                    }
                }
            }
            _ => None,
        };

        if self.config.start_time > 0.0 {
            let start = self.config.start_time;
            match demuxer.seek(start) {
                Ok(()) => {
                    *self.shared.seek_target.lock().unwrap() =
                        self.config.accurate_seek.then_some((0, start));
                }
                Err(e) => tracing::warn!("initial seek to {start:.3}s failed: {e:#}"),
            }
        }

        let streams = Arc::new(ItemStreams {
            info: info.clone(),
            live,
            audio,
            video,
            subtitle,
        });
        if self.streams.set(streams.clone()).is_err() {
            bail!("item opened twice");
        }
        drop(demuxer);
        let _ = self.events.send(ItemEvent::Opened(info));
        Ok(streams)
    }

    fn spawn(
        &self,
        demuxer: &mut dyn Demuxer,
        stream: &StreamInfo,
        packets: Arc<PacketQueue>,
        output: StreamOutput,
    ) -> Result<StreamPipeline> {
        let decoder = demuxer
            .decoder(stream)
            .with_context(|| format!("create {} decoder for stream {}", stream.kind, stream.index))?;
        StreamPipeline::spawn(
            stream.clone(),
            decoder,
            packets,
            output,
            self.shared.clone(),
            self.events.clone(),
        )
    }

    fn read_loop(&self, streams: &ItemStreams) -> Result<()> {
        let mut bitrate = self.demuxer.lock().unwrap().bitrate();

        while !self.shared.stop.load(Ordering::Acquire) {
            let (packet, serial, current_bitrate) = {
                let mut demuxer = self.demuxer.lock().unwrap();
                let packet = demuxer.read_packet().context("read packet")?;
                (packet, self.shared.current_serial(), demuxer.bitrate())
            };

            if let (Some(old), Some(new)) = (bitrate, current_bitrate) {
                if old != new {
                    tracing::info!(old, new, "bitrate changed");
                    let _ = self.events.send(ItemEvent::BitrateChanged { old, new });
                }
            }
            if current_bitrate.is_some() {
                bitrate = current_bitrate;
            }

            let Some(packet) = packet else {
                self.shared.eof_serial.store(serial + 1, Ordering::Release);
                tracing::debug!(serial, "end of input");
                let _ = self.doorbell.try_send(());
                self.wait_for_seek(serial);
                continue;
            };

            let Some(pipeline) = streams.route(packet.stream_index) else {
                continue;
            };
            if let PushOutcome::Closed = pipeline.packets().push(packet, serial) {
                break;
            }
        }
        Ok(())
    }

    /// Park after end of input until a seek starts a new generation or the item stops.
    fn wait_for_seek(&self, serial: u64) {
        while !self.shared.stop.load(Ordering::Acquire) && self.shared.current_serial() == serial {
            thread::sleep(EOF_POLL);
        }
    }
}
