//! Demux and decode collaborators.
//!
//! Container parsing and codec work live outside this crate. A [`Demuxer`] hands out
//! ordered packets and per-stream [`Decoder`]s; the player item drives them from its read
//! and decode threads.

use anyhow::Result;

use crate::frame::{Frame, MediaKind, Packet};
use crate::subtitle::SubtitleEvent;
use crate::timebase::Timebase;

/// Metadata for one elementary stream.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Position in [`MediaInfo::streams`]; matches [`Packet::stream_index`].
    pub index: usize,
    pub kind: MediaKind,
    pub timebase: Timebase,
    pub codec: String,
    /// First presentation time of the stream, in seconds.
    pub start_time: f64,
    pub frame_rate: Option<f64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Disabled streams are demuxed but never decoded.
    pub enabled: bool,
}

impl StreamInfo {
    pub fn new(index: usize, kind: MediaKind, timebase: Timebase) -> Self {
        Self {
            index,
            kind,
            timebase,
            codec: String::new(),
            start_time: 0.0,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            width: None,
            height: None,
            enabled: true,
        }
    }
}

/// What a demuxer reports once opened.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MediaInfo {
    pub streams: Vec<StreamInfo>,
    /// Total duration in seconds; `0.0` for live or unbounded sources.
    pub duration: f64,
    /// Container bitrate in bits per second, when known.
    pub bitrate: Option<u64>,
}

impl MediaInfo {
    /// First enabled stream of `kind`.
    pub fn first(&self, kind: MediaKind) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.kind == kind && s.enabled)
    }

    pub fn is_live(&self) -> bool {
        self.duration <= 0.0 || !self.duration.is_finite()
    }
}

/// Output of a decoder for one packet.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    Subtitle(SubtitleEvent),
}

/// Source of coded packets.
///
/// Called from the item's read thread, and from the controller thread for seeks, never
/// concurrently.
pub trait Demuxer: Send {
    /// Open the input and describe its streams.
    fn open(&mut self) -> Result<MediaInfo>;

    /// Next packet in decode order; `Ok(None)` at end of input.
    fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Reposition so that the next packets start at or before `seconds`.
    fn seek(&mut self, seconds: f64) -> Result<()>;

    /// Create a decoder for one of the streams returned by [`Demuxer::open`].
    fn decoder(&mut self, stream: &StreamInfo) -> Result<Box<dyn Decoder>>;

    /// Current bitrate estimate in bits per second.
    fn bitrate(&self) -> Option<u64> {
        None
    }
}

/// Codec for one elementary stream. Owned by that stream's decode thread.
pub trait Decoder: Send {
    /// Decode one packet. Errors are fatal for the item.
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>>;

    /// Emit frames still buffered inside the codec at end of stream.
    fn drain(&mut self) -> Result<Vec<Decoded>> {
        Ok(Vec::new())
    }

    /// Drop codec state after a seek.
    fn flush(&mut self) {}
}
