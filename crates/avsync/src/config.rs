use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Playback tuning shared by the read, decode and render stages.
///
/// Passed by value when a controller is built; afterwards the controller is the only
/// writer of the fields a running pipeline observes (filter chains, forward buffer,
/// loop play, rate).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Audio filter chain entries, joined with `,`.
    pub audio_filters: Vec<String>,
    /// Video filter chain entries, joined with `,`.
    pub video_filters: Vec<String>,
    /// Seconds of media to buffer before leaving the loading state. `0` disables the
    /// underrun check.
    pub forward_buffer_duration: f64,
    /// Restart from the beginning instead of finishing at end of media.
    pub loop_play: bool,
    /// Drop decoded frames that precede a seek target.
    pub accurate_seek: bool,
    /// Initial position in seconds.
    pub start_time: f64,
    /// Force live (`true`) or on-demand (`false`) queue behaviour; detected from the
    /// media duration when unset.
    pub live: Option<bool>,
    /// Frames each active stream needs before the first (or a post-seek) frame is shown.
    pub min_start_frames: usize,
    /// Decode the first subtitle stream, if any.
    pub subtitles: bool,
    /// Queue ceilings.
    pub queues: QueueConfig,
    /// Live-stream rate adaptation.
    pub live_rate: LiveRateConfig,
    /// Video sink selection and refresh.
    pub video_output: VideoOutputConfig,
}

impl Default for PlayerConfig {
    /// Defaults tuned for local files and typical HLS latency.
    fn default() -> Self {
        Self {
            audio_filters: Vec::new(),
            video_filters: Vec::new(),
            forward_buffer_duration: 3.0,
            loop_play: false,
            accurate_seek: true,
            start_time: 0.0,
            live: None,
            min_start_frames: 1,
            subtitles: true,
            queues: QueueConfig::default(),
            live_rate: LiveRateConfig::default(),
            video_output: VideoOutputConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Load a TOML config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<PlayerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg.normalized())
    }

    /// Replace out-of-range values with safe ones.
    pub fn normalized(mut self) -> Self {
        if !self.forward_buffer_duration.is_finite() || self.forward_buffer_duration < 0.0 {
            self.forward_buffer_duration = 0.0;
        }
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            self.start_time = 0.0;
        }
        self.min_start_frames = self.min_start_frames.max(1);
        self.queues = self.queues.normalized();
        self.live_rate = self.live_rate.normalized();
        if !self.video_output.refresh_hz.is_finite() || self.video_output.refresh_hz <= 0.0 {
            self.video_output.refresh_hz = VideoOutputConfig::default().refresh_hz;
        }
        self
    }

    pub fn audio_chain(&self) -> String {
        join_chain(&self.audio_filters)
    }

    pub fn video_chain(&self) -> String {
        join_chain(&self.video_filters)
    }
}

fn join_chain(entries: &[String]) -> String {
    entries
        .iter()
        .map(|e| e.trim())
        .filter(|e| !e.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Occupancy ceilings for the per-stream queues.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Max packets waiting for a decoder.
    pub packet_max_items: usize,
    /// Max seconds of packets waiting for a decoder.
    pub packet_max_duration: f64,
    /// Max decoded audio frames waiting for the audio sink.
    pub audio_frame_max_items: usize,
    /// Max decoded pictures waiting for the video sink.
    pub video_frame_max_items: usize,
    /// Max seconds of decoded frames per stream.
    pub frame_max_duration: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            packet_max_items: 2048,
            packet_max_duration: 30.0,
            audio_frame_max_items: 64,
            video_frame_max_items: 16,
            frame_max_duration: 2.0,
        }
    }
}

impl QueueConfig {
    fn normalized(mut self) -> Self {
        let d = Self::default();
        self.packet_max_items = self.packet_max_items.max(1);
        self.audio_frame_max_items = self.audio_frame_max_items.max(1);
        self.video_frame_max_items = self.video_frame_max_items.max(1);
        if !(self.packet_max_duration > 0.0) {
            self.packet_max_duration = d.packet_max_duration;
        }
        if !(self.frame_max_duration > 0.0) {
            self.frame_max_duration = d.frame_max_duration;
        }
        self
    }
}

/// Rate nudging for live sources.
///
/// While the buffered-ahead time sits above `high_water * target_buffer` playback runs at
/// `1 + max_rate_delta` until it is back at the target; below `low_water * target_buffer`
/// it runs at `1 - max_rate_delta` until it recovers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveRateConfig {
    pub enabled: bool,
    /// Desired buffered-ahead time in seconds.
    pub target_buffer: f64,
    /// Upper trigger as a multiple of `target_buffer`.
    pub high_water: f64,
    /// Lower trigger as a multiple of `target_buffer`.
    pub low_water: f64,
    /// Largest deviation from 1.0 the rate may take.
    pub max_rate_delta: f64,
}

impl Default for LiveRateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_buffer: 3.0,
            high_water: 1.5,
            low_water: 0.5,
            max_rate_delta: 0.03,
        }
    }
}

impl LiveRateConfig {
    fn normalized(mut self) -> Self {
        let d = Self::default();
        if !(self.target_buffer > 0.0) {
            self.target_buffer = d.target_buffer;
        }
        if !(self.high_water > 1.0) {
            self.high_water = d.high_water;
        }
        if !(self.low_water > 0.0 && self.low_water < 1.0) {
            self.low_water = d.low_water;
        }
        if !(self.max_rate_delta >= 0.0) {
            self.max_rate_delta = d.max_rate_delta;
        }
        self.max_rate_delta = self.max_rate_delta.min(0.5);
        self
    }
}

/// Video sink selection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOutputConfig {
    /// Use the compositor sink for formats it can display natively.
    pub prefer_compositor: bool,
    /// Display refresh rate driving render pulls.
    pub refresh_hz: f64,
}

impl Default for VideoOutputConfig {
    fn default() -> Self {
        Self {
            prefer_compositor: true,
            refresh_hz: 60.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: PlayerConfig = toml::from_str(
            r#"
            audio_filters = ["volume=0.5"]
            loop_play = true

            [live_rate]
            max_rate_delta = 0.05
            "#,
        )
        .unwrap();
        assert_eq!(cfg.audio_chain(), "volume=0.5");
        assert!(cfg.loop_play);
        assert_eq!(cfg.live_rate.max_rate_delta, 0.05);
        assert_eq!(cfg.live_rate.target_buffer, 3.0);
        assert_eq!(cfg.queues, QueueConfig::default());
    }

    #[test]
    fn normalized_repairs_bad_values() {
        let mut cfg = PlayerConfig::default();
        cfg.forward_buffer_duration = f64::NAN;
        cfg.start_time = -4.0;
        cfg.min_start_frames = 0;
        cfg.live_rate.low_water = 3.0;
        cfg.queues.frame_max_duration = -1.0;
        let cfg = cfg.normalized();
        assert_eq!(cfg.forward_buffer_duration, 0.0);
        assert_eq!(cfg.start_time, 0.0);
        assert_eq!(cfg.min_start_frames, 1);
        assert_eq!(cfg.live_rate.low_water, 0.5);
        assert_eq!(cfg.queues.frame_max_duration, 2.0);
    }

    #[test]
    fn chains_skip_blank_entries() {
        let mut cfg = PlayerConfig::default();
        cfg.video_filters = vec!["hflip".into(), " ".into(), "negate".into()];
        assert_eq!(cfg.video_chain(), "hflip,negate");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PlayerConfig::load(Path::new("/nonexistent/avsync.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}
