//! Render sinks and the threads that feed them.
//!
//! Sinks are push targets for presented frames. They are paced by two consumer-side
//! threads:
//! - [`RefreshDriver`]: ticks at the display refresh rate and pulls the next video frame
//!   from a [`RenderSource`] (never blocks; on underrun the sink keeps its last frame)
//! - [`AudioPump`]: pulls audio frames and hands them to the audio sink at the pace of
//!   their durations, reporting each presented time back as the master clock

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Sender, bounded, select, tick};

use crate::frame::{AudioFrame, MediaKind, PixelFormat, VideoFrame};

/// Controls shared by every output surface.
pub trait FrameOutput: Send {
    fn play(&mut self);
    fn pause(&mut self);
    /// Drop everything queued for display (seek, stop).
    fn flush(&mut self);
    /// Forget the displayed frame so the next one is drawn from scratch.
    fn invalidate(&mut self);
}

pub trait VideoSink: FrameOutput {
    fn enqueue(&mut self, frame: VideoFrame) -> Result<()>;
}

pub trait AudioSink: FrameOutput {
    fn enqueue(&mut self, frame: AudioFrame) -> Result<()>;
}

pub type SharedVideoOutput = Arc<Mutex<VideoOutput>>;
pub type SharedAudioSink = Arc<Mutex<Box<dyn AudioSink>>>;

/// What render threads pull from and report back to.
pub trait RenderSource: Send + Sync {
    /// Next picture due at the current clock. `force` returns the front frame regardless
    /// of timing (first frame, post-seek redraw).
    fn next_video_frame(&self, force: bool) -> Option<VideoFrame>;

    /// Next audio frame to hand to the device; `None` while paused or on underrun.
    fn next_audio_frame(&self) -> Option<AudioFrame>;

    /// A frame was actually presented. `position` counts frames presented on that stream.
    fn set_presented(&self, kind: MediaKind, time: f64, position: u64);

    /// Current playback rate.
    fn rate(&self) -> f64;
}

/// Counters shared by the sink implementations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SinkStats {
    pub enqueued: u64,
    pub flushes: u64,
    pub last_pts: Option<f64>,
    pub playing: bool,
}

/// Sink for formats a hardware compositor layer can show as-is.
///
/// Frames are handed over without conversion; the layer keeps a short display queue
/// that a flush empties.
#[derive(Debug, Default)]
pub struct CompositorSink {
    layer: Vec<VideoFrame>,
    stats: SinkStats,
}

/// Display queue depth of the compositor layer.
const LAYER_DEPTH: usize = 3;

impl CompositorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Frame on screen.
    pub fn displayed(&self) -> Option<&VideoFrame> {
        self.layer.last()
    }
}

impl FrameOutput for CompositorSink {
    fn play(&mut self) {
        self.stats.playing = true;
    }

    fn pause(&mut self) {
        self.stats.playing = false;
    }

    fn flush(&mut self) {
        self.layer.clear();
        self.stats.flushes += 1;
    }

    fn invalidate(&mut self) {
        self.layer.clear();
    }
}

impl VideoSink for CompositorSink {
    fn enqueue(&mut self, frame: VideoFrame) -> Result<()> {
        if !frame.format.is_compositor_native() {
            bail!("compositor cannot display {:?}", frame.format);
        }
        if self.layer.len() >= LAYER_DEPTH {
            self.layer.remove(0);
        }
        self.stats.enqueued += 1;
        self.stats.last_pts = Some(frame.pts);
        self.layer.push(frame);
        Ok(())
    }
}

/// Sink that uploads every frame as an RGBA texture, converting on the way.
#[derive(Debug, Default)]
pub struct ShaderSink {
    texture: Vec<u8>,
    width: u32,
    height: u32,
    stats: SinkStats,
}

impl ShaderSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Current texture as `(width, height, rgba)`; `None` when nothing is drawn.
    pub fn texture(&self) -> Option<(u32, u32, &[u8])> {
        (!self.texture.is_empty()).then_some((self.width, self.height, self.texture.as_slice()))
    }
}

impl FrameOutput for ShaderSink {
    fn play(&mut self) {
        self.stats.playing = true;
    }

    fn pause(&mut self) {
        self.stats.playing = false;
    }

    fn flush(&mut self) {
        self.stats.flushes += 1;
    }

    fn invalidate(&mut self) {
        self.texture.clear();
    }
}

impl VideoSink for ShaderSink {
    fn enqueue(&mut self, frame: VideoFrame) -> Result<()> {
        if !frame.is_well_formed() {
            bail!(
                "{:?} frame of {}x{} has {} bytes",
                frame.format,
                frame.width,
                frame.height,
                frame.data.len()
            );
        }
        self.texture = to_rgba(&frame);
        self.width = frame.width;
        self.height = frame.height;
        self.stats.enqueued += 1;
        self.stats.last_pts = Some(frame.pts);
        Ok(())
    }
}

/// Convert any supported layout to packed RGBA (BT.601, limited range for YUV).
pub fn to_rgba(frame: &VideoFrame) -> Vec<u8> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let data = &frame.data;
    match frame.format {
        PixelFormat::Rgba => data.clone(),
        PixelFormat::Bgra => data
            .chunks_exact(4)
            .flat_map(|px| [px[2], px[1], px[0], px[3]])
            .collect(),
        PixelFormat::Gray8 => data.iter().flat_map(|&g| [g, g, g, 255]).collect(),
        PixelFormat::Yuv420p | PixelFormat::Nv12 => {
            let cw = w.div_ceil(2);
            let chroma = &data[w * h..];
            let mut out = Vec::with_capacity(w * h * 4);
            for y in 0..h {
                for x in 0..w {
                    let c = (y / 2) * cw + x / 2;
                    let (u, v) = if frame.format == PixelFormat::Nv12 {
                        (chroma[2 * c], chroma[2 * c + 1])
                    } else {
                        let quarter = cw * h.div_ceil(2);
                        (chroma[c], chroma[quarter + c])
                    };
                    out.extend_from_slice(&yuv_to_rgb(data[y * w + x], u, v));
                    out.push(255);
                }
            }
            out
        }
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = 1.164 * (y as f32 - 16.0);
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.596 * v),
        clamp(y - 0.392 * u - 0.813 * v),
        clamp(y + 2.017 * u),
    ]
}

/// Which video sink handled the most recent frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveSink {
    Compositor,
    Shader,
}

/// Video output that routes each frame to the compositor or the shader sink.
///
/// A frame goes to the compositor when it prefers compositing and the pixel format is
/// native to it. When the route changes the other sink is invalidated so a stale frame
/// never stays on screen.
#[derive(Debug)]
pub struct VideoOutput {
    compositor: CompositorSink,
    shader: ShaderSink,
    prefer_compositor: bool,
    active: Option<ActiveSink>,
}

impl VideoOutput {
    pub fn new(prefer_compositor: bool) -> Self {
        Self {
            compositor: CompositorSink::new(),
            shader: ShaderSink::new(),
            prefer_compositor,
            active: None,
        }
    }

    pub fn select(&self, format: PixelFormat) -> ActiveSink {
        if self.prefer_compositor && format.is_compositor_native() {
            ActiveSink::Compositor
        } else {
            ActiveSink::Shader
        }
    }

    pub fn active(&self) -> Option<ActiveSink> {
        self.active
    }

    pub fn compositor(&self) -> &CompositorSink {
        &self.compositor
    }

    pub fn shader(&self) -> &ShaderSink {
        &self.shader
    }

    /// Frames handed to either sink.
    pub fn enqueued(&self) -> u64 {
        self.compositor.stats.enqueued + self.shader.stats.enqueued
    }

    fn each(&mut self, f: impl Fn(&mut dyn FrameOutput)) {
        f(&mut self.compositor);
        f(&mut self.shader);
    }
}

impl FrameOutput for VideoOutput {
    fn play(&mut self) {
        self.each(|s| s.play());
    }

    fn pause(&mut self) {
        self.each(|s| s.pause());
    }

    fn flush(&mut self) {
        self.each(|s| s.flush());
    }

    fn invalidate(&mut self) {
        self.each(|s| s.invalidate());
        self.active = None;
    }
}

impl VideoSink for VideoOutput {
    fn enqueue(&mut self, frame: VideoFrame) -> Result<()> {
        let route = self.select(frame.format);
        if self.active.is_some_and(|a| a != route) {
            tracing::debug!(?route, format = ?frame.format, "switching video sink");
            match route {
                ActiveSink::Compositor => self.shader.invalidate(),
                ActiveSink::Shader => self.compositor.invalidate(),
            }
        }
        self.active = Some(route);
        match route {
            ActiveSink::Compositor => self.compositor.enqueue(frame),
            ActiveSink::Shader => self.shader.enqueue(frame),
        }
    }
}

/// Audio sink without a device: tracks what was played and its peak level.
#[derive(Debug, Default)]
pub struct MeterSink {
    stats: SinkStats,
    played_seconds: f64,
    peak: f32,
}

impl MeterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn played_seconds(&self) -> f64 {
        self.played_seconds
    }

    /// Largest absolute sample value seen since the last flush.
    pub fn peak(&self) -> f32 {
        self.peak
    }
}

impl FrameOutput for MeterSink {
    fn play(&mut self) {
        self.stats.playing = true;
    }

    fn pause(&mut self) {
        self.stats.playing = false;
    }

    fn flush(&mut self) {
        self.stats.flushes += 1;
        self.peak = 0.0;
    }

    fn invalidate(&mut self) {}
}

impl AudioSink for MeterSink {
    fn enqueue(&mut self, frame: AudioFrame) -> Result<()> {
        self.peak = frame.samples.iter().fold(self.peak, |p, s| p.max(s.abs()));
        self.played_seconds += frame.duration;
        self.stats.enqueued += 1;
        self.stats.last_pts = Some(frame.pts);
        Ok(())
    }
}

/// Pulls video at the display refresh rate.
pub struct RefreshDriver {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    presented: Arc<AtomicU64>,
}

impl RefreshDriver {
    pub fn spawn(source: Arc<dyn RenderSource>, output: SharedVideoOutput, refresh_hz: f64) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let presented = Arc::new(AtomicU64::new(0));
        let presented_thread = presented.clone();
        let period = Duration::from_secs_f64(1.0 / refresh_hz.max(1.0));

        let join = thread::Builder::new()
            .name("avsync-refresh".into())
            .spawn(move || {
                let ticker = tick(period);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let Some(frame) = source.next_video_frame(false) else {
                                continue;
                            };
                            let pts = frame.pts;
                            if let Err(e) = output.lock().unwrap().enqueue(frame) {
                                tracing::warn!(pts, "video sink rejected frame: {e:#}");
                                continue;
                            }
                            let n = presented_thread.fetch_add(1, Ordering::Relaxed) + 1;
                            source.set_presented(MediaKind::Video, pts, n);
                        }
                    }
                }
                tracing::debug!("refresh driver stopped");
            })
            .context("spawn refresh thread")?;

        Ok(Self {
            stop: Some(stop_tx),
            join: Some(join),
            presented,
        })
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("refresh thread panicked");
            }
        }
    }
}

impl Drop for RefreshDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Idle wait when no audio is ready.
const AUDIO_IDLE: Duration = Duration::from_millis(5);

/// Feeds the audio sink in real time.
pub struct AudioPump {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl AudioPump {
    pub fn spawn(source: Arc<dyn RenderSource>, sink: SharedAudioSink) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let join = thread::Builder::new()
            .name("avsync-audio".into())
            .spawn(move || {
                let mut position = 0u64;
                loop {
                    let wait = match source.next_audio_frame() {
                        Some(frame) => {
                            let (pts, duration) = (frame.pts, frame.duration);
                            if let Err(e) = sink.lock().unwrap().enqueue(frame) {
                                tracing::warn!(pts, "audio sink rejected frame: {e:#}");
                            }
                            position += 1;
                            source.set_presented(MediaKind::Audio, pts, position);
                            let rate = source.rate();
                            let rate = if rate > 0.0 { rate } else { 1.0 };
                            Duration::from_secs_f64((duration / rate).max(0.0))
                        }
                        None => AUDIO_IDLE,
                    };
                    // Disconnected means stop; a timeout means the frame has played.
                    if let Err(crossbeam_channel::RecvTimeoutError::Disconnected) = stop_rx.recv_timeout(wait) {
                        break;
                    }
                }
                tracing::debug!("audio pump stopped");
            })
            .context("spawn audio thread")?;

        Ok(Self {
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("audio thread panicked");
            }
        }
    }
}

impl Drop for AudioPump {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Instant;

    fn picture(pts: f64, format: PixelFormat) -> VideoFrame {
        VideoFrame::new(pts, 0.04, format, 2, 2, vec![128; format.frame_len(2, 2)])
    }

    #[test]
    fn routes_by_format_and_preference() {
        let mut out = VideoOutput::new(true);
        out.enqueue(picture(0.0, PixelFormat::Nv12)).unwrap();
        assert_eq!(out.active(), Some(ActiveSink::Compositor));
        out.enqueue(picture(0.04, PixelFormat::Yuv420p)).unwrap();
        assert_eq!(out.active(), Some(ActiveSink::Shader));
        assert!(out.compositor().displayed().is_none());
        assert_eq!(out.enqueued(), 2);

        let out = VideoOutput::new(false);
        assert_eq!(out.select(PixelFormat::Bgra), ActiveSink::Shader);
    }

    #[test]
    fn compositor_rejects_non_native_formats() {
        let mut sink = CompositorSink::new();
        assert!(sink.enqueue(picture(0.0, PixelFormat::Rgba)).is_err());
        for i in 0..5 {
            sink.enqueue(picture(i as f64, PixelFormat::Bgra)).unwrap();
        }
        assert_eq!(sink.displayed().unwrap().pts, 4.0);
        sink.flush();
        assert!(sink.displayed().is_none());
        assert_eq!(sink.stats().flushes, 1);
    }

    #[test]
    fn shader_converts_to_rgba() {
        let mut sink = ShaderSink::new();
        let bgra = VideoFrame::new(0.0, 0.04, PixelFormat::Bgra, 1, 1, vec![1, 2, 3, 4]);
        sink.enqueue(bgra).unwrap();
        assert_eq!(sink.texture().unwrap().2, &[3, 2, 1, 4]);

        // Mid grey in limited-range YUV.
        let yuv = VideoFrame::new(0.0, 0.04, PixelFormat::Yuv420p, 2, 2, vec![126, 126, 126, 126, 128, 128]);
        sink.enqueue(yuv).unwrap();
        let (w, h, rgba) = sink.texture().unwrap();
        assert_eq!((w, h), (2, 2));
        assert!(rgba.chunks(4).all(|px| px[0] == px[1] && px[1] == px[2] && px[3] == 255));

        let short = VideoFrame::new(0.0, 0.04, PixelFormat::Rgba, 2, 2, vec![0; 3]);
        assert!(sink.enqueue(short).is_err());
        sink.invalidate();
        assert!(sink.texture().is_none());
    }

    #[test]
    fn nv12_and_yuv420p_agree() {
        let y = [16u8, 80, 160, 235];
        let mut planar = y.to_vec();
        planar.extend([90, 200]);
        let mut nv12 = y.to_vec();
        nv12.extend([90, 200]);
        let a = to_rgba(&VideoFrame::new(0.0, 0.0, PixelFormat::Yuv420p, 2, 2, planar));
        let b = to_rgba(&VideoFrame::new(0.0, 0.0, PixelFormat::Nv12, 2, 2, nv12));
        assert_eq!(a, b);
    }

    #[test]
    fn meter_tracks_peak_and_time() {
        let mut sink = MeterSink::new();
        sink.enqueue(AudioFrame::new(0.0, 100, 1, vec![0.1, -0.8, 0.3])).unwrap();
        assert_eq!(sink.peak(), 0.8);
        assert!((sink.played_seconds() - 0.03).abs() < 1e-9);
        sink.flush();
        assert_eq!(sink.peak(), 0.0);
    }

    struct Scripted {
        video: Mutex<VecDeque<VideoFrame>>,
        audio: Mutex<VecDeque<AudioFrame>>,
        presented: Mutex<Vec<(MediaKind, f64, u64)>>,
    }

    impl RenderSource for Scripted {
        fn next_video_frame(&self, _force: bool) -> Option<VideoFrame> {
            self.video.lock().unwrap().pop_front()
        }

        fn next_audio_frame(&self) -> Option<AudioFrame> {
            self.audio.lock().unwrap().pop_front()
        }

        fn set_presented(&self, kind: MediaKind, time: f64, position: u64) {
            self.presented.lock().unwrap().push((kind, time, position));
        }

        fn rate(&self) -> f64 {
            2.0
        }
    }

    #[test]
    fn drivers_present_pulled_frames() {
        let source = Arc::new(Scripted {
            video: Mutex::new((0..3).map(|i| picture(i as f64 * 0.04, PixelFormat::Rgba)).collect()),
            audio: Mutex::new((0..2).map(|i| AudioFrame::new(i as f64 * 0.01, 1_000, 1, vec![0.0; 10])).collect()),
            presented: Mutex::new(Vec::new()),
        });
        let output = Arc::new(Mutex::new(VideoOutput::new(true)));
        let sink: SharedAudioSink = Arc::new(Mutex::new(Box::new(MeterSink::new())));

        let mut refresh = RefreshDriver::spawn(source.clone(), output.clone(), 200.0).unwrap();
        let mut pump = AudioPump::spawn(source.clone(), sink).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while source.presented.lock().unwrap().len() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        refresh.stop();
        pump.stop();

        let presented = source.presented.lock().unwrap();
        let video: Vec<_> = presented.iter().filter(|p| p.0 == MediaKind::Video).collect();
        let audio: Vec<_> = presented.iter().filter(|p| p.0 == MediaKind::Audio).collect();
        assert_eq!(video.len(), 3);
        assert_eq!(video[2].2, 3);
        assert_eq!(audio.len(), 2);
        assert_eq!(audio[1].1, 0.01);
        assert_eq!(refresh.presented(), 3);
        assert_eq!(output.lock().unwrap().shader().stats().last_pts, Some(0.08));
    }
}
