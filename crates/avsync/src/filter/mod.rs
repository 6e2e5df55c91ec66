//! Per-stream filter graphs.
//!
//! A [`FilterGraph`] runs decoded frames through a chain of named filters. The graph is
//! rebuilt from scratch whenever the frame format, geometry or chain string differs from
//! the last build ([`GraphKey`]); it is never patched in place. When a chain cannot be
//! built the input frame passes through unchanged.

mod audio;
pub mod chain;
mod resample;
mod video;

use anyhow::{Result, bail};

use crate::frame::{Frame, MediaKind, PixelFormat, Timed};
use crate::timebase::Timebase;

pub use chain::{FilterSpec, parse_chain, with_tempo};

/// Format half of a [`GraphKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormatKey {
    Pixel(PixelFormat),
    Sample { sample_rate: u32, channels: u16 },
}

/// Everything a built graph depends on. Any difference forces a rebuild.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GraphKey {
    pub format: FormatKey,
    pub width: u32,
    pub height: u32,
    pub chain: String,
}

impl GraphKey {
    pub fn of(frame: &Frame, chain: &str) -> Self {
        match frame {
            Frame::Audio(a) => Self {
                format: FormatKey::Sample {
                    sample_rate: a.sample_rate,
                    channels: a.channels,
                },
                width: 0,
                height: 0,
                chain: chain.to_string(),
            },
            Frame::Video(v) => Self {
                format: FormatKey::Pixel(v.format),
                width: v.width,
                height: v.height,
                chain: chain.to_string(),
            },
        }
    }
}

/// Parameters of the graph source (and of every link downstream of it).
#[derive(Clone, Debug, PartialEq)]
pub struct SourceParams {
    pub kind: MediaKind,
    pub format: FormatKey,
    pub width: u32,
    pub height: u32,
    pub timebase: Timebase,
    /// Nominal video frame rate, when known.
    pub frame_rate: Option<f64>,
}

/// A single filter instance inside a built graph.
///
/// Filters may buffer: one input can yield zero, one or many outputs.
pub(crate) trait FilterNode: Send {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>);

    /// Emit anything still buffered at end of stream.
    fn flush(&mut self, _out: &mut Vec<Frame>) {}
}

/// `null` / `anull`.
struct Passthrough;

impl FilterNode for Passthrough {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        out.push(frame);
    }
}

fn stamp_audio_duration(frames: &mut [Frame], duration: f64) {
    for f in frames.iter_mut() {
        if let Frame::Audio(a) = f {
            a.duration = duration;
        }
    }
}

/// Filter graph bound to one elementary stream.
pub struct FilterGraph {
    kind: MediaKind,
    timebase: Timebase,
    frame_rate: Option<f64>,
    key: Option<GraphKey>,
    nodes: Option<Vec<Box<dyn FilterNode>>>,
    rebuilds: u64,
    /// Duration of the last audio input, stamped on flushed tail frames.
    last_audio_duration: Option<f64>,
}

impl FilterGraph {
    /// Create an empty graph for frames of `kind`.
    pub fn new(kind: MediaKind, timebase: Timebase, frame_rate: Option<f64>) -> Self {
        Self {
            kind,
            timebase,
            frame_rate,
            key: None,
            nodes: None,
            rebuilds: 0,
            last_audio_duration: None,
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// How many times the graph has been (re)built.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Whether a valid graph is currently installed.
    pub fn is_active(&self) -> bool {
        self.nodes.is_some()
    }

    /// Run `frame` through `chain`.
    ///
    /// An empty chain, a frame of the other media kind, or a chain that fails to build
    /// returns the input untouched. Audio outputs carry the input's duration.
    pub fn apply(&mut self, frame: Frame, chain: &str) -> Vec<Frame> {
        if frame.kind() != self.kind {
            return vec![frame];
        }
        let chain = chain.trim();
        if chain.is_empty() {
            if self.key.is_some() {
                self.key = None;
                self.nodes = None;
            }
            return vec![frame];
        }

        let key = GraphKey::of(&frame, chain);
        if self.key.as_ref() != Some(&key) {
            self.nodes = None;
            self.rebuilds += 1;
            match self.build(&key) {
                Ok(nodes) => {
                    tracing::debug!(kind = %self.kind, chain, "filter graph built");
                    self.nodes = Some(nodes);
                }
                Err(e) => {
                    tracing::warn!(kind = %self.kind, chain, "filter graph setup failed, passing frames through: {e:#}");
                }
            }
            self.key = Some(key);
        }

        let Some(nodes) = self.nodes.as_mut() else {
            return vec![frame];
        };

        let input_duration = frame.duration();
        let mut frames = vec![frame];
        for node in nodes.iter_mut() {
            let mut next = Vec::with_capacity(frames.len());
            for f in frames.drain(..) {
                node.process(f, &mut next);
            }
            frames = next;
        }

        if self.kind == MediaKind::Audio {
            self.last_audio_duration = Some(input_duration);
            stamp_audio_duration(&mut frames, input_duration);
        }
        frames
    }

    /// Drain buffered output at end of stream.
    pub fn flush(&mut self) -> Vec<Frame> {
        let Some(nodes) = self.nodes.as_mut() else {
            return Vec::new();
        };
        let mut carried = Vec::new();
        for node in nodes.iter_mut() {
            let mut next = Vec::new();
            for f in carried.drain(..) {
                node.process(f, &mut next);
            }
            node.flush(&mut next);
            carried = next;
        }
        if let Some(duration) = self.last_audio_duration.take() {
            stamp_audio_duration(&mut carried, duration);
        }
        carried
    }

    /// Discard the graph and its buffered state; the next frame rebuilds it.
    pub fn reset(&mut self) {
        self.key = None;
        self.nodes = None;
        self.last_audio_duration = None;
    }

    fn build(&self, key: &GraphKey) -> Result<Vec<Box<dyn FilterNode>>> {
        let specs = parse_chain(&key.chain)?;
        let mut params = SourceParams {
            kind: self.kind,
            format: key.format,
            width: key.width,
            height: key.height,
            timebase: self.timebase,
            frame_rate: self.frame_rate,
        };

        let mut nodes: Vec<Box<dyn FilterNode>> = Vec::with_capacity(specs.len());
        for spec in &specs {
            let (node, out) = build_node(spec, &params)?;
            nodes.push(node);
            params = out;
        }
        validate_sink(&params)?;
        Ok(nodes)
    }
}

fn build_node(spec: &FilterSpec, params: &SourceParams) -> Result<(Box<dyn FilterNode>, SourceParams)> {
    if matches!(spec.name.as_str(), "null" | "anull" | "copy" | "acopy") {
        return Ok((Box::new(Passthrough), params.clone()));
    }
    match params.kind {
        MediaKind::Audio => audio::build(spec, params),
        MediaKind::Video => video::build(spec, params),
        MediaKind::Subtitle => bail!("subtitle streams have no filters"),
    }
}

fn validate_sink(params: &SourceParams) -> Result<()> {
    match (params.kind, params.format) {
        (MediaKind::Audio, FormatKey::Sample { sample_rate, channels }) => {
            if sample_rate == 0 || channels == 0 {
                bail!("audio sink rejects {sample_rate} Hz / {channels} channels");
            }
        }
        (MediaKind::Video, FormatKey::Pixel(_)) => {
            if params.width == 0 || params.height == 0 {
                bail!("video sink rejects {}x{}", params.width, params.height);
            }
        }
        (kind, format) => bail!("sink for {kind} cannot accept {format:?}"),
    }
    Ok(())
}
