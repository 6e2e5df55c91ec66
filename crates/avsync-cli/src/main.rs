//! `avsync` drives the sync controller from the command line.
//!
//! ## Sources
//! - `play`: a local audio file, demuxed and decoded with Symphonia.
//! - `synthetic`: a generated picture/tone/caption clip, or a paced live stream.
//!
//! Audio is rendered into a metering sink and video into the compositor/shader outputs, so
//! a run exercises the full read → decode → filter → queue → clock → render path without
//! a device. Player events are logged, or printed as JSON lines with `--json-events`.

mod cli;
mod media;
mod synthetic;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use avsync::subtitle::{SubtitlePart, parse_srt, parse_vtt};
use avsync::{Demuxer, MeterSink, PixelFormat, PlayerConfig, PlayerEvent, SyncController};
use clap::Parser;
use crossbeam_channel::{Receiver, select};
use tracing_subscriber::EnvFilter;

use crate::media::FileMedia;
use crate::synthetic::{SyntheticMedia, SyntheticSpec};

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,avsync=info")
        }))
        .init();

    let config = player_config(&args)?;
    let demuxer = open_source(&args.cmd)?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let _ = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    });

    let controller = SyncController::new(config, Box::new(MeterSink::new()))?;
    let events = controller.subscribe();
    if let Some(path) = &args.subtitles {
        let parts = load_subtitles(path)?;
        tracing::info!(path = ?path, parts = parts.len(), "sidecar subtitles loaded");
        controller.add_subtitles(parts);
    }
    controller.prepare(demuxer)?;
    controller.start_render()?;
    if args.rate != 1.0 {
        controller.set_playback_rate(args.rate)?;
    }
    controller.play();

    let outcome = run(&controller, &events, &stop_rx, &args);
    controller.stop();
    report_status(&controller, args.json_events)?;
    outcome
}

/// Config file (or defaults) with command-line overrides applied.
fn player_config(args: &cli::Args) -> Result<PlayerConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    config.audio_filters.extend(args.audio_filters.iter().cloned());
    config.video_filters.extend(args.video_filters.iter().cloned());
    if let Some(seconds) = args.forward_buffer {
        config.forward_buffer_duration = seconds;
    }
    if args.loop_play {
        config.loop_play = true;
    }
    if let Some(start) = args.start {
        config.start_time = start;
    }
    Ok(config.normalized())
}

fn open_source(cmd: &cli::Command) -> Result<Box<dyn Demuxer>> {
    Ok(match cmd {
        cli::Command::Play { path } => Box::new(FileMedia::new(path)),
        cli::Command::Synthetic {
            seconds,
            fps,
            width,
            height,
            format,
            tone_hz,
            captions,
        } => {
            let format = PixelFormat::parse(format)
                .with_context(|| format!("unknown pixel format {format:?}"))?;
            Box::new(SyntheticMedia::new(SyntheticSpec {
                seconds: *seconds,
                fps: *fps,
                width: *width,
                height: *height,
                format,
                tone_hz: *tone_hz,
                captions: *captions,
            })?)
        }
    })
}

fn load_subtitles(path: &Path) -> Result<Vec<SubtitlePart>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    let is_vtt = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("vtt"));
    let parts = if is_vtt { parse_vtt(&raw) } else { parse_srt(&raw) };
    parts.with_context(|| format!("parse {:?}", path))
}

/// Pump events until the item finishes, the run time elapses or the user interrupts.
fn run(
    controller: &SyncController,
    events: &Receiver<PlayerEvent>,
    stop_rx: &Receiver<()>,
    args: &cli::Args,
) -> Result<()> {
    let deadline = match args.duration {
        Some(seconds) => crossbeam_channel::at(Instant::now() + Duration::from_secs_f64(seconds.max(0.0))),
        None => crossbeam_channel::never(),
    };
    let mut pending_seek = args.seek;

    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else {
                    return Ok(());
                };
                report_event(&event, args.json_events)?;
                match event {
                    PlayerEvent::ReadyToPlay { .. } => {
                        if let Some(target) = pending_seek.take() {
                            if !controller.seek(target) {
                                tracing::warn!(target, "seek rejected");
                            }
                        }
                    }
                    PlayerEvent::Finished { error: Some(error) } => bail!("playback failed: {error}"),
                    PlayerEvent::Finished { error: None } => return Ok(()),
                    _ => {}
                }
            }
            recv(stop_rx) -> _ => {
                tracing::info!("interrupted");
                return Ok(());
            }
            recv(deadline) -> _ => {
                tracing::info!("run time reached");
                return Ok(());
            }
        }
    }
}

fn report_event(event: &PlayerEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event).context("encode event")?);
        return Ok(());
    }
    match event {
        PlayerEvent::ReadyToPlay { duration } => tracing::info!(duration, "ready to play"),
        PlayerEvent::StateChanged { from, to } => tracing::info!(?from, ?to, "state"),
        PlayerEvent::LoadingStateChanged { loading } => tracing::debug!(
            playable = loading.is_playable,
            loaded = loading.loaded_time,
            frames = loading.frame_count,
            packets = loading.packet_count,
            "loading"
        ),
        PlayerEvent::BufferingProgress { percent } => tracing::info!(percent, "buffering"),
        PlayerEvent::BitrateChanged { old, new } => tracing::info!(old, new, "bitrate changed"),
        PlayerEvent::LoopCompleted { count } => tracing::info!(count, "loop completed"),
        PlayerEvent::Finished { error: None } => tracing::info!("finished"),
        PlayerEvent::Finished { error: Some(error) } => tracing::error!("finished with error: {error}"),
    }
    Ok(())
}

fn report_status(controller: &SyncController, json: bool) -> Result<()> {
    let status = controller.status();
    if json {
        println!("{}", serde_json::to_string(&status).context("encode status")?);
        return Ok(());
    }
    let presented = controller.video_output().lock().unwrap().enqueued();
    tracing::info!(
        state = ?status.state,
        position = status.current_time,
        duration = status.duration,
        rate = status.rate,
        loops = status.loop_count,
        presented,
        dropped = status.dropped_video_frames,
        "done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        cli::Args::command().debug_assert();
    }

    #[test]
    fn flags_extend_and_override_config() {
        let args = cli::Args::try_parse_from([
            "avsync",
            "--audio-filter",
            "volume=0.5",
            "--video-filter",
            "hflip",
            "--forward-buffer",
            "1.5",
            "--loop-play",
            "--start=-3",
            "synthetic",
        ])
        .unwrap();
        let config = player_config(&args).unwrap();
        assert_eq!(config.audio_chain(), "volume=0.5");
        assert_eq!(config.video_chain(), "hflip");
        assert_eq!(config.forward_buffer_duration, 1.5);
        assert!(config.loop_play);
        // Negative start positions are normalized away.
        assert_eq!(config.start_time, 0.0);
    }

    #[test]
    fn synthetic_rejects_unknown_pixel_format() {
        let args =
            cli::Args::try_parse_from(["avsync", "synthetic", "--format", "p010"]).unwrap();
        let err = open_source(&args.cmd).err().unwrap();
        assert!(err.to_string().contains("p010"));
    }

    #[test]
    fn sidecar_format_follows_extension() {
        let dir = std::env::temp_dir();
        let vtt = dir.join(format!("avsync-{}-cues.vtt", std::process::id()));
        std::fs::write(&vtt, "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nhello\n").unwrap();
        let parts = load_subtitles(&vtt).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].as_text(), Some("hello"));
        std::fs::remove_file(vtt).ok();

        let srt = dir.join(format!("avsync-{}-cues.srt", std::process::id()));
        std::fs::write(&srt, "1\n00:00:01,000 --> 00:00:02,000\nhello\n").unwrap();
        assert_eq!(load_subtitles(&srt).unwrap().len(), 1);
        std::fs::remove_file(srt).ok();
    }
}
