use std::path::PathBuf;

use clap::{Parser, Subcommand};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "avsync", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Player config file (TOML); flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Audio filter entry, e.g. `volume=0.5` (repeatable)
    #[arg(long = "audio-filter")]
    pub audio_filters: Vec<String>,

    /// Video filter entry, e.g. `crop=160:90` (repeatable)
    #[arg(long = "video-filter")]
    pub video_filters: Vec<String>,

    /// Seconds to buffer before leaving the loading state (0 disables underrun checks)
    #[arg(long)]
    pub forward_buffer: Option<f64>,

    /// Restart from the beginning at end of media
    #[arg(long)]
    pub loop_play: bool,

    /// Playback rate (applied to the audio chain as tempo)
    #[arg(long, default_value_t = 1.0)]
    pub rate: f64,

    /// Initial position in seconds
    #[arg(long)]
    pub start: Option<f64>,

    /// Seek here once the item is ready to play
    #[arg(long)]
    pub seek: Option<f64>,

    /// Stop after this many seconds of wall time
    #[arg(long)]
    pub duration: Option<f64>,

    /// Sidecar subtitles (.srt or .vtt)
    #[arg(long)]
    pub subtitles: Option<PathBuf>,

    /// Print player events as JSON lines on stdout
    #[arg(long)]
    pub json_events: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local audio file
    Play {
        /// Path to the audio file (FLAC, MP3, WAV, ...)
        path: PathBuf,
    },

    /// Play a generated test pattern with a tone track
    Synthetic {
        /// Media length in seconds; 0 makes a paced live stream
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,

        /// Picture rate
        #[arg(long, default_value_t = 25)]
        fps: u32,

        #[arg(long, default_value_t = 320)]
        width: u32,

        #[arg(long, default_value_t = 180)]
        height: u32,

        /// Decoded pixel format: yuv420p, nv12, bgra, rgba or gray
        #[arg(long, default_value = "yuv420p")]
        format: String,

        /// Tone frequency in Hz; 0 disables the audio track
        #[arg(long, default_value_t = 440.0)]
        tone_hz: f64,

        /// Add an embedded caption track with one line per second
        #[arg(long)]
        captions: bool,
    },
}
