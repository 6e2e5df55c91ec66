//! Scripted media source shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use avsync::subtitle::SubtitleEvent;
use avsync::{
    AudioFrame, Decoded, Decoder, Demuxer, Frame, MediaInfo, MediaKind, Packet, PixelFormat,
    PlayerEvent, PlayerState, StreamInfo, SyncController, Timebase, VideoFrame,
};
use crossbeam_channel::Receiver;

const VIDEO: usize = 0;
const AUDIO: usize = 1;
const SUBTITLE: usize = 2;
pub const AUDIO_ALT: usize = 3;

/// Sample value written by the decoder of the main and the alternate audio stream.
pub const AUDIO_LEVEL: f32 = 0.25;
pub const AUDIO_ALT_LEVEL: f32 = 0.75;

/// Demuxer over a precomputed, time-ordered packet list.
pub struct FakeMedia {
    video_frames: i64,
    audio_packets: i64,
    alternate_audio: bool,
    subtitles: Vec<(f64, SubtitleEvent)>,
    duration: Option<f64>,
    packets: Vec<Packet>,
    cursor: usize,
    /// While set, `read_packet` waits (stands in for a stalled network read).
    hold: Arc<AtomicBool>,
    hold_on_seek: bool,
    hold_at: Option<usize>,
}

impl FakeMedia {
    /// `frames` pictures at 25 fps on a `1/25` timebase.
    pub fn video(frames: i64) -> Self {
        Self {
            video_frames: frames,
            audio_packets: 0,
            alternate_audio: false,
            subtitles: Vec::new(),
            duration: None,
            packets: Vec::new(),
            cursor: 0,
            hold: Arc::new(AtomicBool::new(false)),
            hold_on_seek: false,
            hold_at: None,
        }
    }

    /// Add `packets` 20 ms stereo audio packets on a `1/1000` timebase.
    pub fn with_audio(mut self, packets: i64) -> Self {
        self.audio_packets = packets;
        self
    }

    /// Add a second audio stream (index [`AUDIO_ALT`]) alongside the first one.
    pub fn with_alternate_audio(mut self) -> Self {
        self.alternate_audio = true;
        self
    }

    pub fn with_subtitle(mut self, pts: f64, event: SubtitleEvent) -> Self {
        self.subtitles.push((pts, event));
        self
    }

    /// Report this duration instead of the one implied by the packets (`0.0` = live).
    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Stall reads after each successful seek until [`FakeMedia::gate`] is released.
    pub fn hold_after_seek(mut self) -> Self {
        self.hold_on_seek = true;
        self
    }

    /// Stall reads once `n` packets were delivered.
    pub fn hold_after(mut self, n: usize) -> Self {
        self.hold_at = Some(n);
        self
    }

    /// Handle to release a stalled read: store `false`.
    pub fn gate(&self) -> Arc<AtomicBool> {
        self.hold.clone()
    }

    fn build_packets(&mut self) {
        let mut packets = Vec::new();
        for i in 0..self.video_frames {
            packets.push(packet(VIDEO, i, 1, Timebase::new(1, 25), vec![1]));
        }
        for i in 0..self.audio_packets {
            packets.push(packet(AUDIO, i * 20, 20, Timebase::MILLIS, vec![1]));
            if self.alternate_audio {
                packets.push(packet(AUDIO_ALT, i * 20, 20, Timebase::MILLIS, vec![1]));
            }
        }
        for (n, (pts, _)) in self.subtitles.iter().enumerate() {
            let ts = Timebase::MILLIS.from_seconds(*pts);
            packets.push(packet(SUBTITLE, ts, 0, Timebase::MILLIS, vec![n as u8]));
        }
        packets.sort_by(|a, b| a.pts_seconds().total_cmp(&b.pts_seconds()));
        self.packets = packets;
    }

    fn natural_duration(&self) -> f64 {
        (self.video_frames as f64 / 25.0).max(self.audio_packets as f64 * 0.02)
    }
}

fn packet(stream_index: usize, timestamp: i64, duration: i64, timebase: Timebase, payload: Vec<u8>) -> Packet {
    Packet {
        stream_index,
        timestamp,
        duration,
        timebase,
        keyframe: true,
        payload,
    }
}

impl Demuxer for FakeMedia {
    fn open(&mut self) -> Result<MediaInfo> {
        self.build_packets();
        let mut streams = Vec::new();
        if self.video_frames > 0 {
            let mut video = StreamInfo::new(VIDEO, MediaKind::Video, Timebase::new(1, 25));
            video.frame_rate = Some(25.0);
            video.width = Some(2);
            video.height = Some(2);
            streams.push(video);
        }
        if self.audio_packets > 0 {
            let mut audio = StreamInfo::new(AUDIO, MediaKind::Audio, Timebase::MILLIS);
            audio.sample_rate = Some(48_000);
            audio.channels = Some(2);
            streams.push(audio);
        }
        if !self.subtitles.is_empty() {
            streams.push(StreamInfo::new(SUBTITLE, MediaKind::Subtitle, Timebase::MILLIS));
        }
        if self.alternate_audio && self.audio_packets > 0 {
            let mut alternate = StreamInfo::new(AUDIO_ALT, MediaKind::Audio, Timebase::MILLIS);
            alternate.codec = "alternate".into();
            alternate.sample_rate = Some(48_000);
            alternate.channels = Some(2);
            streams.push(alternate);
        }
        Ok(MediaInfo {
            streams,
            duration: self.duration.unwrap_or_else(|| self.natural_duration()),
            bitrate: None,
        })
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        if self.hold_at == Some(self.cursor) {
            self.hold_at = None;
            self.hold.store(true, Ordering::Release);
        }
        while self.hold.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        let packet = self.packets.get(self.cursor).cloned();
        if packet.is_some() {
            self.cursor += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        if seconds > self.natural_duration() + 1.0 {
            bail!("seek past end");
        }
        self.cursor = self
            .packets
            .partition_point(|p| p.pts_seconds() < seconds - 1e-9);
        if self.hold_on_seek {
            self.hold.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn decoder(&mut self, stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
        Ok(match stream.kind {
            MediaKind::Video => Box::new(GrayDecoder),
            MediaKind::Audio if stream.index == AUDIO_ALT => Box::new(ToneDecoder(AUDIO_ALT_LEVEL)),
            MediaKind::Audio => Box::new(ToneDecoder(AUDIO_LEVEL)),
            MediaKind::Subtitle => Box::new(ScriptDecoder(
                self.subtitles.iter().map(|(_, e)| e.clone()).collect(),
            )),
        })
    }
}

struct GrayDecoder;

impl Decoder for GrayDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        Ok(vec![Decoded::Frame(Frame::Video(VideoFrame::new(
            packet.pts_seconds(),
            packet.duration_seconds(),
            PixelFormat::Gray8,
            2,
            2,
            vec![0x80; 4],
        )))])
    }
}

struct ToneDecoder(f32);

impl Decoder for ToneDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        Ok(vec![Decoded::Frame(Frame::Audio(AudioFrame::new(
            packet.pts_seconds(),
            48_000,
            2,
            vec![self.0; 960 * 2],
        )))])
    }
}

struct ScriptDecoder(Vec<SubtitleEvent>);

impl Decoder for ScriptDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        let event = self.0[packet.payload[0] as usize].clone();
        Ok(vec![Decoded::Subtitle(event)])
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

pub fn wait_for_state(ctl: &SyncController, state: PlayerState) -> bool {
    wait_until(Duration::from_secs(5), || ctl.state() == state)
}

/// Collect events until `pred` matches one, or the timeout passes.
pub fn collect_until(
    events: &Receiver<PlayerEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&PlayerEvent) -> bool,
) -> (Vec<PlayerEvent>, bool) {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match events.recv_timeout(left) {
            Ok(event) => {
                let hit = pred(&event);
                seen.push(event);
                if hit {
                    return (seen, true);
                }
            }
            Err(_) => break,
        }
    }
    (seen, false)
}

/// `(from, to)` pairs of every state change in `events`.
pub fn transitions(events: &[PlayerEvent]) -> Vec<(PlayerState, PlayerState)> {
    events
        .iter()
        .filter_map(|e| match e {
            PlayerEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
