//! Packets and decoded frames moved between pipeline stages.
//!
//! Ownership travels with the value: demux thread → decode thread → filter graph →
//! frame queue → render consumer. Nothing here is shared.

use std::fmt;

use crate::timebase::Timebase;

/// Elementary stream kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Subtitle,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Subtitle => "subtitle",
        };
        f.write_str(name)
    }
}

/// Anything with a presentation time and a duration, both in seconds.
pub trait Timed {
    fn pts(&self) -> f64;
    fn duration(&self) -> f64;
}

/// Pixel layout of a [`VideoFrame`] payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Gray8,
    /// Three planes: Y, then U and V at quarter resolution.
    Yuv420p,
    /// Bi-planar: Y, then interleaved UV at quarter resolution.
    Nv12,
}

impl PixelFormat {
    /// Bytes per pixel for packed layouts, `None` for planar ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Yuv420p | PixelFormat::Nv12 => None,
        }
    }

    /// Buffer size for a `width x height` image.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self.bytes_per_pixel() {
            Some(bpp) => w * h * bpp,
            None => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
        }
    }

    /// Formats a hardware compositor can display without a conversion pass.
    pub fn is_compositor_native(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::Bgra)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rgba" => Some(PixelFormat::Rgba),
            "bgra" => Some(PixelFormat::Bgra),
            "gray" | "gray8" => Some(PixelFormat::Gray8),
            "yuv420p" => Some(PixelFormat::Yuv420p),
            "nv12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

/// Decoded interleaved `f32` audio.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Presentation time in seconds.
    pub pts: f64,
    /// Duration in seconds. Filters may resize the payload; this stays authoritative.
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples: `frame0[ch0], frame0[ch1], ..., frame1[ch0], ...`.
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Build a frame whose duration is derived from the sample count.
    pub fn new(pts: f64, sample_rate: u32, channels: u16, samples: Vec<f32>) -> Self {
        let frames = samples.len() / channels.max(1) as usize;
        let duration = if sample_rate == 0 {
            0.0
        } else {
            frames as f64 / sample_rate as f64
        };
        Self {
            pts,
            duration,
            sample_rate,
            channels,
            samples,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Decoded picture.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
    pub pts: f64,
    pub duration: f64,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Tightly packed planes, no row padding.
    pub data: Vec<u8>,
}

impl VideoFrame {
    pub fn new(pts: f64, duration: f64, format: PixelFormat, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            pts,
            duration,
            format,
            width,
            height,
            data,
        }
    }

    /// Whether the payload size matches the declared geometry.
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.format.frame_len(self.width, self.height)
    }
}

/// A decoded frame of either kind, as handled by the filter graph.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl Frame {
    pub fn kind(&self) -> MediaKind {
        match self {
            Frame::Audio(_) => MediaKind::Audio,
            Frame::Video(_) => MediaKind::Video,
        }
    }

    pub fn into_audio(self) -> Option<AudioFrame> {
        match self {
            Frame::Audio(frame) => Some(frame),
            Frame::Video(_) => None,
        }
    }

    pub fn into_video(self) -> Option<VideoFrame> {
        match self {
            Frame::Video(frame) => Some(frame),
            Frame::Audio(_) => None,
        }
    }
}

/// Coded packet as produced by a demuxer.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    /// Index of the stream in the demuxer's stream list.
    pub stream_index: usize,
    /// Presentation timestamp in `timebase` ticks.
    pub timestamp: i64,
    /// Duration in `timebase` ticks; `0` when unknown.
    pub duration: i64,
    pub timebase: Timebase,
    pub keyframe: bool,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn pts_seconds(&self) -> f64 {
        self.timebase.to_seconds(self.timestamp)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.timebase.to_seconds(self.duration)
    }
}

impl Timed for Packet {
    fn pts(&self) -> f64 {
        self.pts_seconds()
    }

    fn duration(&self) -> f64 {
        self.duration_seconds()
    }
}

impl Timed for AudioFrame {
    fn pts(&self) -> f64 {
        self.pts
    }

    fn duration(&self) -> f64 {
        self.duration
    }
}

impl Timed for VideoFrame {
    fn pts(&self) -> f64 {
        self.pts
    }

    fn duration(&self) -> f64 {
        self.duration
    }
}

impl Timed for Frame {
    fn pts(&self) -> f64 {
        match self {
            Frame::Audio(frame) => frame.pts,
            Frame::Video(frame) => frame.pts,
        }
    }

    fn duration(&self) -> f64 {
        match self {
            Frame::Audio(frame) => frame.duration,
            Frame::Video(frame) => frame.duration,
        }
    }
}
