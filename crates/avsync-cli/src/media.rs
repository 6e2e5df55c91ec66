//! Local audio files through Symphonia.
//!
//! The container is probed once in [`Demuxer::open`]; each audio track becomes one
//! stream, decoded into interleaved `f32` frames.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use avsync::{
    AudioFrame, Decoded, Decoder, Demuxer, Frame, MediaInfo, MediaKind, Packet, StreamInfo,
    Timebase,
};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet as CodedPacket, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

struct Track {
    id: u32,
    params: CodecParameters,
    timebase: Timebase,
}

/// Demuxer over a local file.
pub struct FileMedia {
    path: PathBuf,
    format: Option<Box<dyn FormatReader>>,
    tracks: Vec<Track>,
}

impl FileMedia {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            format: None,
            tracks: Vec::new(),
        }
    }
}

impl Demuxer for FileMedia {
    fn open(&mut self) -> Result<MediaInfo> {
        let file = File::open(&self.path).with_context(|| format!("open {:?}", self.path))?;

        let mut hint = Hint::new();
        if let Some(ext) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .with_context(|| format!("probe {:?}", self.path))?;
        let format = probed.format;

        let mut info = MediaInfo::default();
        self.tracks.clear();
        for track in format.tracks() {
            let params = &track.codec_params;
            if params.codec == CODEC_TYPE_NULL {
                continue;
            }
            let timebase = track_timebase(params);
            let mut stream = StreamInfo::new(self.tracks.len(), MediaKind::Audio, timebase);
            stream.codec = symphonia::default::get_codecs()
                .get_codec(params.codec)
                .map(|d| d.short_name.to_string())
                .unwrap_or_default();
            stream.start_time = timebase.to_seconds(i64::try_from(params.start_ts).unwrap_or(0));
            stream.sample_rate = params.sample_rate;
            stream.channels = params.channels.map(|c| c.count() as u16);
            info.duration = info.duration.max(duration_from_codec_params(params).unwrap_or(0.0));
            info.streams.push(stream);
            self.tracks.push(Track {
                id: track.id,
                params: params.clone(),
                timebase,
            });
        }
        if info.streams.is_empty() {
            bail!("{:?} has no decodable audio track", self.path);
        }

        tracing::info!(
            path = ?self.path,
            tracks = info.streams.len(),
            duration = info.duration,
            "opened file"
        );
        self.format = Some(format);
        Ok(info)
    }

    fn read_packet(&mut self) -> Result<Option<Packet>> {
        let format = self
            .format
            .as_mut()
            .ok_or_else(|| anyhow!("{:?} is not open", self.path))?;
        loop {
            let coded = match format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    tracing::warn!("track layout changed mid-stream; treating as end of input");
                    return Ok(None);
                }
                Err(e) => return Err(e).context("read packet"),
            };
            let Some(index) = self.tracks.iter().position(|t| t.id == coded.track_id()) else {
                continue;
            };
            return Ok(Some(Packet {
                stream_index: index,
                timestamp: i64::try_from(coded.ts()).unwrap_or(i64::MAX),
                duration: i64::try_from(coded.dur()).unwrap_or(0),
                timebase: self.tracks[index].timebase,
                keyframe: true,
                payload: coded.buf().to_vec(),
            }));
        }
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        let format = self
            .format
            .as_mut()
            .ok_or_else(|| anyhow!("{:?} is not open", self.path))?;
        let seconds = seconds.max(0.0);
        let time = Time::new(seconds.trunc() as u64, seconds.fract());
        let seeked = format
            .seek(SeekMode::Coarse, SeekTo::Time { time, track_id: None })
            .with_context(|| format!("seek to {seconds:.3}s"))?;
        tracing::debug!(
            required = seeked.required_ts,
            actual = seeked.actual_ts,
            "file seeked"
        );
        Ok(())
    }

    fn decoder(&mut self, stream: &StreamInfo) -> Result<Box<dyn Decoder>> {
        let track = self
            .tracks
            .get(stream.index)
            .ok_or_else(|| anyhow!("no track for stream {}", stream.index))?;
        let inner = symphonia::default::get_codecs()
            .make(&track.params, &DecoderOptions::default())
            .with_context(|| format!("create decoder for {}", stream.codec))?;
        Ok(Box::new(FileDecoder {
            inner,
            track_id: track.id,
        }))
    }
}

struct FileDecoder {
    inner: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
}

impl Decoder for FileDecoder {
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Decoded>> {
        let coded = CodedPacket::new_from_slice(
            self.track_id,
            u64::try_from(packet.timestamp).unwrap_or(0),
            u64::try_from(packet.duration).unwrap_or(0),
            &packet.payload,
        );
        let decoded = match self.inner.decode(&coded) {
            Ok(d) => d,
            // Corrupt packets are skipped, the stream keeps going.
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::warn!(pts = packet.pts_seconds(), "skipping undecodable packet: {msg}");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e).context("decode audio packet"),
        };
        if decoded.frames() == 0 {
            return Ok(Vec::new());
        }

        let spec = *decoded.spec();
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let frame = AudioFrame::new(
            packet.pts_seconds(),
            spec.rate,
            spec.channels.count() as u16,
            sample_buf.samples().to_vec(),
        );
        Ok(vec![Decoded::Frame(Frame::Audio(frame))])
    }

    fn flush(&mut self) {
        self.inner.reset();
    }
}

fn track_timebase(params: &CodecParameters) -> Timebase {
    params
        .time_base
        .and_then(|tb| {
            let num = i32::try_from(tb.numer).ok()?;
            let den = i32::try_from(tb.denom).ok().filter(|d| *d > 0)?;
            Some(Timebase::new(num, den))
        })
        .unwrap_or_else(|| Timebase::from_rate(params.sample_rate.unwrap_or(1)))
}

/// Duration in seconds from codec metadata, when the container reports a frame count.
fn duration_from_codec_params(params: &CodecParameters) -> Option<f64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate?;
    if rate == 0 {
        return None;
    }
    Some(frames as f64 / rate as f64)
}
