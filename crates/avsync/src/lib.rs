//! Decode, filter and A/V synchronization core.
//!
//! Data flow: [`Demuxer`] → packet queue → [`Decoder`] → [`FilterGraph`] → frame queue →
//! render pull ([`RenderSource`]) → sinks, with the [`SyncController`] owning playback
//! state, the master clock and outward [`PlayerEvent`]s.

pub mod clock;
pub mod config;
pub mod controller;
pub mod events;
pub mod filter;
pub mod frame;
pub mod item;
pub mod live_rate;
pub mod pipeline;
pub mod queue;
pub mod sink;
pub mod source;
pub mod subtitle;
pub mod timebase;

pub use avsync_types::{
    LoadingState, PlaybackEndReason, PlayerEvent, PlayerState, PlayerStatus, buffering_percent,
};
pub use config::PlayerConfig;
pub use controller::SyncController;
pub use events::EventBus;
pub use filter::FilterGraph;
pub use frame::{AudioFrame, Frame, MediaKind, Packet, PixelFormat, VideoFrame};
pub use queue::{OverflowPolicy, QueueLimits, TimedQueue};
pub use sink::{AudioSink, FrameOutput, MeterSink, RenderSource, VideoOutput, VideoSink};
pub use source::{Decoded, Decoder, Demuxer, MediaInfo, StreamInfo};
pub use subtitle::{SubtitlePart, SubtitleTimeline};
pub use timebase::Timebase;
