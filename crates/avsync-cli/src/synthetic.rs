//! Generated test media.
//!
//! A sliding bar pattern at `fps`, a sine tone in 1024-sample packets and, optionally, one
//! caption per second. With `seconds == 0` the source is live: packets are released no
//! faster than wall time and seeking is refused.

use std::f64::consts::TAU;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use avsync::subtitle::{SubtitleEvent, SubtitleRect};
use avsync::{
    AudioFrame, Decoded, Decoder, Demuxer, Frame, MediaInfo, MediaKind, Packet, PixelFormat,
    StreamInfo, Timebase, VideoFrame,
};

const VIDEO: usize = 0;
const AUDIO: usize = 1;
const CAPTIONS: usize = 2;

const SAMPLE_RATE: u32 = 48_000;
const AUDIO_PACKET_FRAMES: i64 = 1024;

#[derive(Clone, Debug)]
pub struct SyntheticSpec {
    pub seconds: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub tone_hz: f64,
    pub captions: bool,
}

impl SyntheticSpec {
    fn is_live(&self) -> bool {
        self.seconds <= 0.0
    }
}

pub struct SyntheticMedia {
    spec: SyntheticSpec,
    /// Next packet index per stream.
    next: [i64; 3],
    /// Wall time matching media time zero, for live pacing.
    epoch: Option<Instant>,
}

impl SyntheticMedia {
    pub fn new(spec: SyntheticSpec) -> Result<Self> {
        if spec.fps == 0 {
            bail!("fps must be positive");
        }
        if spec.width == 0 || spec.height == 0 {
            bail!("picture size must be positive, got {}x{}", spec.width, spec.height);
        }
        Ok(Self {
            spec,
            next: [0; 3],
            epoch: None,
        })
    }

    fn has_stream(&self, index: usize) -> bool {
        match index {
            VIDEO => true,
            AUDIO => self.spec.tone_hz > 0.0,
            CAPTIONS => self.spec.captions,
            _ => false,
        }
    }

    fn timebase(&self, index: usize) -> Timebase {
        match index {
            VIDEO => Timebase::new(1, self.spec.fps as i32),
            AUDIO => Timebase::from_rate(SAMPLE_RATE),
            _ => Timebase::MILLIS,
        }
    }

    /// Timestamp and duration, in stream ticks, of packet `n` of `index`.
    fn ticks(index: usize, n: i64) -> (i64, i64) {
        match index {
            VIDEO => (n, 1),
            AUDIO => (n * AUDIO_PACKET_FRAMES, AUDIO_PACKET_FRAMES),
            _ => (n * 1_000, 1_000),
        }
    }

    fn pts(&self, index: usize, n: i64) -> f64 {
        self.timebase(index).to_seconds(Self::ticks(index, n).0)
    }

    /// Stream whose next packet has the lowest timestamp.
    fn next_stream(&self) -> Option<(usize, f64)> {
        (0..3)
            .filter(|i| self.has_stream(*i))
            .map(|i| (i, self.pts(i, self.next[i])))
            .filter(|(_, pts)| self.spec.is_live() || *pts < self.spec.seconds)
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }
}

impl Demuxer for SyntheticMedia {
    fn open(&mut self) -> Result<MediaInfo> {
        let mut streams = Vec::new();

        let mut video = StreamInfo::new(VIDEO, MediaKind::Video, self.timebase(VIDEO));
        video.codec = "pattern".into();
        video.frame_rate = Some(self.spec.fps as f64);
        video.width = Some(self.spec.width);
        video.height = Some(self.spec.height);
        streams.push(video);

        if self.has_stream(AUDIO) {
            let mut audio = StreamInfo::new(AUDIO, MediaKind::Audio, self.timebase(AUDIO));
            audio.codec = "tone".into();
            audio.sample_rate = Some(SAMPLE_RATE);
            audio.channels = Some(2);
            streams.push(audio);
        }
        if self.has_stream(CAPTIONS) {
            let mut captions = StreamInfo::new(CAPTIONS, MediaKind::Subtitle, Timebase::MILLIS);
            captions.codec = "text".into();
            streams.push(captions);
        }

        self.next = [0; 3];
        self.epoch = Some(Instant::now());
        Ok(MediaInfo {
            streams,
            duration: self.spec.seconds.max(0.0),
            bitrate: None,
        })
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let Some((index, pts)) = self.next_stream() else {
            return Ok(None);
        };
        if self.spec.is_live() {
            let epoch = self.epoch.ok_or_else(|| anyhow!("synthetic source is not open"))?;
            let due = epoch + Duration::from_secs_f64(pts);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }

        let n = self.next[index];
        self.next[index] += 1;
        let (timestamp, duration) = Self::ticks(index, n);
        Ok(Some(Packet {
            stream_index: index,
            timestamp,
            duration,
            timebase: self.timebase(index),
            keyframe: true,
            payload: n.to_le_bytes().to_vec(),
        }))
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        if self.spec.is_live() {
            bail!("live source cannot seek");
        }
        let seconds = seconds.clamp(0.0, self.spec.seconds);
        self.next = [
            (seconds * self.spec.fps as f64).floor() as i64,
            (seconds * SAMPLE_RATE as f64 / AUDIO_PACKET_FRAMES as f64).floor() as i64,
            seconds.floor() as i64,
        ];
        Ok(())
    }

    fn decoder(&mut self, stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
        Ok(match stream.index {
            VIDEO => Box::new(PatternDecoder {
                format: self.spec.format,
                width: self.spec.width,
                height: self.spec.height,
            }),
            AUDIO => Box::new(ToneDecoder {
                tone_hz: self.spec.tone_hz,
            }),
            CAPTIONS => Box::new(CaptionDecoder),
            other => bail!("unknown synthetic stream {other}"),
        })
    }
}

fn packet_index(packet: &Packet) -> Result<i64> {
    let bytes: [u8; 8] = packet
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("malformed synthetic packet ({} bytes)", packet.payload.len()))?;
    Ok(i64::from_le_bytes(bytes))
}

struct PatternDecoder {
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl PatternDecoder {
    /// Bar position for picture `n`: four pixels per frame, wrapping.
    fn bar_x(&self, n: i64) -> usize {
        (n.rem_euclid(self.width as i64 / 4 + 1) * 4) as usize
    }

    fn luma(&self, n: i64) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar = self.bar_x(n);
        let mut plane = vec![16u8; w * h];
        for row in plane.chunks_exact_mut(w) {
            for x in bar..(bar + 4).min(w) {
                row[x] = 235;
            }
        }
        plane
    }

    fn render(&self, n: i64) -> Vec<u8> {
        let luma = self.luma(n);
        let chroma_len = self.format.frame_len(self.width, self.height) - luma.len();
        match self.format {
            PixelFormat::Gray8 => luma,
            PixelFormat::Yuv420p | PixelFormat::Nv12 => {
                let mut data = luma;
                data.resize(data.len() + chroma_len, 128);
                data
            }
            PixelFormat::Rgba | PixelFormat::Bgra => luma
                .iter()
                .flat_map(|&y| [y, y, y, 255])
                .collect(),
        }
    }
}

impl Decoder for PatternDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        let n = packet_index(packet)?;
        Ok(vec![Decoded::Frame(Frame::Video(VideoFrame::new(
            packet.pts_seconds(),
            packet.duration_seconds(),
            self.format,
            self.width,
            self.height,
            self.render(n),
        )))])
    }
}

struct ToneDecoder {
    tone_hz: f64,
}

impl Decoder for ToneDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        let first = packet_index(packet)? * AUDIO_PACKET_FRAMES;
        let samples = (0..AUDIO_PACKET_FRAMES)
            .flat_map(|k| {
                let t = (first + k) as f64 / SAMPLE_RATE as f64;
                let s = ((TAU * self.tone_hz * t).sin() * 0.2) as f32;
                [s, s]
            })
            .collect();
        Ok(vec![Decoded::Frame(Frame::Audio(AudioFrame::new(
            packet.pts_seconds(),
            SAMPLE_RATE,
            2,
            samples,
        )))])
    }
}

struct CaptionDecoder;

impl Decoder for CaptionDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        let n = packet_index(packet)?;
        Ok(vec![Decoded::Subtitle(SubtitleEvent {
            start_display_ms: 0,
            end_display_ms: Some(900),
            rects: vec![SubtitleRect::Text(format!("second {n}"))],
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(seconds: f64) -> SyntheticSpec {
        SyntheticSpec {
            seconds,
            fps: 25,
            width: 16,
            height: 8,
            format: PixelFormat::Yuv420p,
            tone_hz: 440.0,
            captions: true,
        }
    }

    fn drain(media: &mut SyntheticMedia) -> Vec<Packet> {
        std::iter::from_fn(|| media.read_packet().unwrap()).collect()
    }

    #[test]
    fn packets_interleave_in_time_order() {
        let mut media = SyntheticMedia::new(spec(2.0)).unwrap();
        let info = media.open().unwrap();
        assert_eq!(info.streams.len(), 3);
        assert_eq!(info.duration, 2.0);

        let packets = drain(&mut media);
        assert!(packets.windows(2).all(|w| w[0].pts_seconds() <= w[1].pts_seconds()));
        let count = |i| packets.iter().filter(|p| p.stream_index == i).count();
        assert_eq!(count(VIDEO), 50);
        assert_eq!(count(AUDIO), 94);
        assert_eq!(count(CAPTIONS), 2);
    }

    #[test]
    fn seek_restarts_each_stream_at_or_before_target() {
        let mut media = SyntheticMedia::new(spec(10.0)).unwrap();
        media.open().unwrap();
        media.seek(4.3).unwrap();
        let packets = drain(&mut media);
        for index in [VIDEO, AUDIO, CAPTIONS] {
            let first = packets.iter().find(|p| p.stream_index == index).unwrap();
            assert!(first.pts_seconds() <= 4.3);
            assert!(first.pts_seconds() > 3.0);
        }
    }

    #[test]
    fn live_source_is_paced_and_unseekable() {
        let mut spec = spec(0.0);
        spec.tone_hz = 0.0;
        spec.captions = false;
        let mut media = SyntheticMedia::new(spec).unwrap();
        let info = media.open().unwrap();
        assert!(info.is_live());
        assert!(media.seek(1.0).is_err());

        let started = Instant::now();
        for _ in 0..4 {
            media.read_packet().unwrap().unwrap();
        }
        // The fourth picture is due at 0.12 s.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn pattern_matches_declared_format() {
        for format in [
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::Bgra,
            PixelFormat::Rgba,
            PixelFormat::Gray8,
        ] {
            let mut s = spec(1.0);
            s.format = format;
            let mut media = SyntheticMedia::new(s).unwrap();
            let info = media.open().unwrap();
            let mut decoder = media.decoder(&info.streams[VIDEO]).unwrap();
            let packet = media.read_packet().unwrap().unwrap();
            let Decoded::Frame(Frame::Video(frame)) = decoder.decode(&packet).unwrap().remove(0)
            else {
                panic!("expected a picture");
            };
            assert_eq!(frame.data.len(), format.frame_len(16, 8), "{format:?}");
        }
    }

    #[test]
    fn captions_carry_their_second() {
        let mut media = SyntheticMedia::new(spec(3.0)).unwrap();
        let info = media.open().unwrap();
        let mut decoder = media.decoder(&info.streams[CAPTIONS]).unwrap();
        let packet = drain(&mut media)
            .into_iter()
            .filter(|p| p.stream_index == CAPTIONS)
            .nth(2)
            .unwrap();
        assert_eq!(packet.pts_seconds(), 2.0);
        let Decoded::Subtitle(event) = decoder.decode(&packet).unwrap().remove(0) else {
            panic!("expected a caption");
        };
        assert_eq!(event.rects, vec![SubtitleRect::Text("second 2".into())]);
    }

    #[test]
    fn rejects_zero_fps() {
        let mut s = spec(1.0);
        s.fps = 0;
        assert!(SyntheticMedia::new(s).is_err());
    }
}
