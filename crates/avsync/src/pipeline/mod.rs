//! Per-stream decode pipelines.
//!
//! Each elementary stream gets a [`StreamPipeline`]: a packet queue filled by the read
//! thread, one decode thread that runs the codec and the filter graph, and an output
//! (frame queue or subtitle timeline).
//!
//! Seeks are coordinated through the item-wide serial in [`PipelineShared`]: packets are
//! popped together with the serial they were queued under, and every frame derived from a
//! packet is pushed with that serial, so work that straddles a flush is rejected by the
//! destination queue.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::filter::FilterGraph;
use crate::frame::{Frame, MediaKind, Packet, Timed};
use crate::item::ItemEvent;
use crate::queue::{AudioFrameQueue, Occupancy, PacketQueue, PushOutcome, VideoFrameQueue};
use crate::source::{Decoded, Decoder, StreamInfo};
use crate::subtitle::{SubtitleTimeline, assemble_parts};

/// How long a decode thread waits on an empty packet queue before re-checking EOF/stop.
const PACKET_POLL: Duration = Duration::from_millis(10);

/// State shared between an item's read thread, decode threads and controller.
#[derive(Debug, Default)]
pub struct PipelineShared {
    /// Current seek generation.
    pub serial: AtomicU64,
    /// `serial + 1` once the demuxer hit end of input under that serial; `0` otherwise.
    pub eof_serial: AtomicU64,
    /// Accurate-seek target for a serial: frames ending before it are dropped.
    pub seek_target: Mutex<Option<(u64, f64)>>,
    pub stop: AtomicBool,
    pub audio_chain: Mutex<Arc<str>>,
    pub video_chain: Mutex<Arc<str>>,
}

impl PipelineShared {
    pub fn new(audio_chain: &str, video_chain: &str) -> Self {
        Self {
            audio_chain: Mutex::new(Arc::from(audio_chain)),
            video_chain: Mutex::new(Arc::from(video_chain)),
            ..Default::default()
        }
    }

    pub fn current_serial(&self) -> u64 {
        self.serial.load(Ordering::Acquire)
    }

    /// Whether the demuxer reached end of input in the current generation.
    pub fn is_eof(&self) -> bool {
        self.eof_serial.load(Ordering::Acquire) == self.current_serial() + 1
    }

    fn chain(&self, kind: MediaKind) -> Arc<str> {
        let slot = match kind {
            MediaKind::Video => &self.video_chain,
            _ => &self.audio_chain,
        };
        slot.lock().unwrap().clone()
    }

    fn seek_target_for(&self, serial: u64) -> Option<f64> {
        match *self.seek_target.lock().unwrap() {
            Some((s, target)) if s == serial => Some(target),
            _ => None,
        }
    }
}

/// Where decoded output of a stream lands.
#[derive(Clone)]
pub enum StreamOutput {
    Audio(Arc<AudioFrameQueue>),
    Video(Arc<VideoFrameQueue>),
    Subtitle(Arc<Mutex<SubtitleTimeline>>),
}

impl StreamOutput {
    fn occupancy(&self) -> Occupancy {
        match self {
            StreamOutput::Audio(q) => q.occupancy(),
            StreamOutput::Video(q) => q.occupancy(),
            StreamOutput::Subtitle(_) => Occupancy::default(),
        }
    }

    fn is_full(&self) -> bool {
        match self {
            StreamOutput::Audio(q) => q.len() >= q.limits().max_items,
            StreamOutput::Video(q) => q.len() >= q.limits().max_items,
            StreamOutput::Subtitle(_) => false,
        }
    }

    fn flush(&self, serial: u64) {
        match self {
            StreamOutput::Audio(q) => q.flush(serial),
            StreamOutput::Video(q) => q.flush(serial),
            StreamOutput::Subtitle(timeline) => timeline.lock().unwrap().clear(),
        }
    }

    fn close(&self) {
        match self {
            StreamOutput::Audio(q) => q.close(),
            StreamOutput::Video(q) => q.close(),
            StreamOutput::Subtitle(_) => {}
        }
    }
}

/// Occupancy of one stream: coded packets plus decoded frames.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamOccupancy {
    pub packets: Occupancy,
    pub frames: Occupancy,
    /// The frame queue is at its item ceiling.
    pub frames_full: bool,
}

impl StreamOccupancy {
    /// Seconds of media buffered in this stream.
    pub fn loaded_time(&self) -> f64 {
        self.packets.duration + self.frames.duration
    }
}

/// A decoder for another stream of the same kind, taken over by the decode thread at the
/// first packet of generation `serial` or later.
struct TrackSwitch {
    serial: u64,
    info: StreamInfo,
    decoder: Box<dyn Decoder>,
}

type PendingSwitch = Arc<Mutex<Option<TrackSwitch>>>;

/// One elementary stream: packet queue → decode thread → output.
pub struct StreamPipeline {
    kind: MediaKind,
    info: Mutex<StreamInfo>,
    /// Demuxer stream whose packets are routed here.
    stream_index: AtomicUsize,
    packets: Arc<PacketQueue>,
    output: StreamOutput,
    drained_serial: Arc<AtomicU64>,
    switch: PendingSwitch,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPipeline {
    /// Start the decode thread for `info`.
    pub fn spawn(
        info: StreamInfo,
        decoder: Box<dyn Decoder>,
        packets: Arc<PacketQueue>,
        output: StreamOutput,
        shared: Arc<PipelineShared>,
        events: Sender<ItemEvent>,
    ) -> Result<Self> {
        let drained_serial = Arc::new(AtomicU64::new(0));
        let switch = PendingSwitch::default();
        let worker = DecodeWorker {
            graph: FilterGraph::new(info.kind, info.timebase, info.frame_rate),
            info: info.clone(),
            decoder,
            packets: packets.clone(),
            output: output.clone(),
            shared,
            drained_serial: drained_serial.clone(),
            switch: switch.clone(),
            events,
            last_serial: None,
            drop_before: None,
        };
        let join = thread::Builder::new()
            .name(format!("avsync-{}-decode", info.kind))
            .spawn(move || worker.run())
            .with_context(|| format!("spawn {} decode thread", info.kind))?;

        Ok(Self {
            kind: info.kind,
            stream_index: AtomicUsize::new(info.index),
            info: Mutex::new(info),
            packets,
            output,
            drained_serial,
            switch,
            join: Mutex::new(Some(join)),
        })
    }

    /// The stream currently decoded by this pipeline.
    pub fn info(&self) -> StreamInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index.load(Ordering::Acquire)
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Route packets of `info` here from now on and decode them with `decoder` from
    /// generation `serial`. The caller starts that generation and flushes the queues.
    pub fn switch_to(&self, serial: u64, info: StreamInfo, decoder: Box<dyn Decoder>) {
        tracing::debug!(kind = %self.kind, from = self.stream_index(), to = info.index, serial, "switching stream");
        self.stream_index.store(info.index, Ordering::Release);
        *self.info.lock().unwrap() = info.clone();
        *self.switch.lock().unwrap() = Some(TrackSwitch { serial, info, decoder });
    }

    pub fn packets(&self) -> &Arc<PacketQueue> {
        &self.packets
    }

    pub fn output(&self) -> &StreamOutput {
        &self.output
    }

    pub fn occupancy(&self) -> StreamOccupancy {
        StreamOccupancy {
            packets: self.packets.occupancy(),
            frames: self.output.occupancy(),
            frames_full: self.output.is_full(),
        }
    }

    /// Whether the decoder has been drained at end of input in generation `serial`.
    pub fn is_drained(&self, serial: u64) -> bool {
        self.drained_serial.load(Ordering::Acquire) == serial + 1
    }

    /// Empty both queues and move them to generation `serial`.
    pub fn flush(&self, serial: u64) {
        self.packets.flush(serial);
        self.output.flush(serial);
    }

    /// Close both queues, waking any blocked producer or consumer.
    pub fn close(&self) {
        self.packets.close();
        self.output.close();
    }

    /// Wait for the decode thread to exit. Call after [`StreamPipeline::close`].
    pub fn join(&self) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(kind = %self.kind, "decode thread panicked");
            }
        }
    }
}

struct DecodeWorker {
    info: StreamInfo,
    decoder: Box<dyn Decoder>,
    graph: FilterGraph,
    packets: Arc<PacketQueue>,
    output: StreamOutput,
    shared: Arc<PipelineShared>,
    drained_serial: Arc<AtomicU64>,
    switch: PendingSwitch,
    events: Sender<ItemEvent>,
    last_serial: Option<u64>,
    drop_before: Option<f64>,
}

impl DecodeWorker {
    fn run(mut self) {
        tracing::debug!(kind = %self.info.kind, stream = self.info.index, "decode thread started");
        while !self.shared.stop.load(Ordering::Acquire) {
            match self.packets.pop_tagged(PACKET_POLL) {
                Some((packet, serial)) => {
                    self.resync(serial);
                    let decoded = self.decoder.decode(&packet);
                    if !self.handle(decoded, Some(&packet), serial) {
                        break;
                    }
                }
                None => {
                    if self.packets.is_closed() {
                        break;
                    }
                    if !self.drain_if_finished() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(kind = %self.info.kind, "decode thread exiting");
    }

    /// Reset codec and filter state when the generation changes.
    fn resync(&mut self, serial: u64) {
        if self.last_serial == Some(serial) {
            return;
        }
        let switch = {
            let mut pending = self.switch.lock().unwrap();
            match pending.as_ref() {
                Some(s) if s.serial <= serial => pending.take(),
                _ => None,
            }
        };
        if let Some(switch) = switch {
            tracing::debug!(kind = %self.info.kind, stream = switch.info.index, serial, "decoder replaced");
            self.graph = FilterGraph::new(switch.info.kind, switch.info.timebase, switch.info.frame_rate);
            self.info = switch.info;
            self.decoder = switch.decoder;
        } else if self.last_serial.is_some() {
            self.decoder.flush();
            self.graph.reset();
        }
        self.last_serial = Some(serial);
        self.drop_before = self.shared.seek_target_for(serial);
    }

    /// At end of input, push out whatever the codec and filters still hold.
    ///
    /// Returns `false` when the thread should exit.
    fn drain_if_finished(&mut self) -> bool {
        let serial = self.packets.serial();
        let eof = self.shared.eof_serial.load(Ordering::Acquire) == serial + 1;
        if !eof
            || self.drained_serial.load(Ordering::Acquire) == serial + 1
            || !self.packets.is_empty()
        {
            return true;
        }

        self.resync(serial);
        let decoded = self.decoder.drain();
        if !self.handle(decoded, None, serial) {
            return false;
        }
        let tail: Vec<Frame> = self.graph.flush();
        for frame in tail {
            if !self.push_frame(frame, serial) {
                return false;
            }
        }
        self.drained_serial.store(serial + 1, Ordering::Release);
        tracing::debug!(kind = %self.info.kind, serial, "decoder drained");
        true
    }

    /// Route decoder output. Returns `false` when the thread should exit.
    fn handle(&mut self, decoded: Result<Vec<Decoded>>, packet: Option<&Packet>, serial: u64) -> bool {
        let outputs = match decoded {
            Ok(outputs) => outputs,
            Err(e) if self.info.kind == MediaKind::Subtitle => {
                tracing::warn!(stream = self.info.index, "subtitle decode failed, skipping event: {e:#}");
                return true;
            }
            Err(e) => {
                tracing::error!(kind = %self.info.kind, "decode error: {e:#}");
                let _ = self.events.send(ItemEvent::Failed(format!(
                    "{} decoder: {e:#}",
                    self.info.kind
                )));
                return false;
            }
        };

        for out in outputs {
            match out {
                Decoded::Frame(frame) => {
                    let chain = self.shared.chain(self.info.kind);
                    for filtered in self.graph.apply(frame, &chain) {
                        if !self.push_frame(filtered, serial) {
                            return false;
                        }
                    }
                }
                Decoded::Subtitle(event) => {
                    let (pts, duration) = packet
                        .map(|p| (p.pts_seconds(), p.duration_seconds()))
                        .unwrap_or((0.0, 0.0));
                    let parts = assemble_parts(&event, pts, duration, self.info.start_time);
                    if let StreamOutput::Subtitle(timeline) = &self.output {
                        if self.shared.current_serial() == serial {
                            let mut timeline = timeline.lock().unwrap();
                            for part in parts {
                                timeline.insert(part);
                            }
                        }
                    }
                }
            }
        }
        true
    }

    /// Push one filtered frame. Returns `false` once the destination is closed.
    fn push_frame(&mut self, frame: Frame, serial: u64) -> bool {
        if let Some(target) = self.drop_before {
            if frame.pts() + frame.duration() <= target {
                return true;
            }
        }
        let outcome = match (&self.output, frame) {
            (StreamOutput::Audio(q), Frame::Audio(a)) => q.push(a, serial),
            (StreamOutput::Video(q), Frame::Video(v)) => q.push(v, serial),
            (_, other) => {
                tracing::warn!(kind = %self.info.kind, got = %other.kind(), "decoder produced a frame of the wrong kind");
                return true;
            }
        };
        !matches!(outcome, PushOutcome::Closed)
    }
}
