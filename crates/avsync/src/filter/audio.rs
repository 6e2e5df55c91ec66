//! Audio filters: `volume`, `atempo`, `aresample`.

use anyhow::{Result, anyhow, bail};

use super::resample::ResampleNode;
use super::{FilterNode, FilterSpec, FormatKey, SourceParams};
use crate::frame::{AudioFrame, Frame};

pub(super) fn build(spec: &FilterSpec, params: &SourceParams) -> Result<(Box<dyn FilterNode>, SourceParams)> {
    let FormatKey::Sample { sample_rate, channels } = params.format else {
        bail!("{}: audio filter on non-audio input", spec.name);
    };

    match spec.name.as_str() {
        "volume" => {
            let gain = parse_gain(spec.arg(0, "volume"))?;
            Ok((Box::new(Volume { gain }), params.clone()))
        }
        "atempo" => {
            let tempo = spec
                .num_arg(0, "tempo")?
                .ok_or_else(|| anyhow!("atempo: missing tempo"))?;
            if !(0.5..=2.0).contains(&tempo) {
                bail!("atempo: tempo {tempo} outside 0.5..=2.0");
            }
            Ok((
                Box::new(Atempo::new(tempo, sample_rate, channels)),
                params.clone(),
            ))
        }
        "aresample" => {
            let rate = spec
                .num_arg(0, "sample_rate")?
                .ok_or_else(|| anyhow!("aresample: missing rate"))?;
            if !(rate >= 1.0 && rate <= 768_000.0) {
                bail!("aresample: invalid rate {rate}");
            }
            let dst_rate = rate.round() as u32;
            let node = ResampleNode::new(sample_rate, dst_rate, channels)?;
            let mut out = params.clone();
            out.format = FormatKey::Sample {
                sample_rate: dst_rate,
                channels,
            };
            Ok((Box::new(node), out))
        }
        other => bail!("unknown audio filter {other:?}"),
    }
}

fn parse_gain(raw: Option<&str>) -> Result<f32> {
    let raw = raw.ok_or_else(|| anyhow!("volume: missing gain"))?.trim();
    let gain = match raw.strip_suffix("dB").or_else(|| raw.strip_suffix("db")) {
        Some(db) => {
            let db: f32 = db.trim().parse().map_err(|_| anyhow!("volume: bad dB value {raw:?}"))?;
            10f32.powf(db / 20.0)
        }
        None => raw.parse().map_err(|_| anyhow!("volume: bad gain {raw:?}"))?,
    };
    if !gain.is_finite() || gain < 0.0 {
        bail!("volume: gain {raw:?} out of range");
    }
    Ok(gain)
}

struct Volume {
    gain: f32,
}

impl FilterNode for Volume {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Audio(mut a) = frame else {
            out.push(frame);
            return;
        };
        for s in a.samples.iter_mut() {
            *s *= self.gain;
        }
        out.push(Frame::Audio(a));
    }
}

/// Grain size of the overlap-add stretcher, in sample frames.
const TEMPO_WINDOW: usize = 1024;

/// Overlap-add time stretch.
///
/// Hann-windowed grains are read from the input every `hop * tempo` frames and written
/// to the output every `hop` frames, with `hop = window / 2` so the windows sum to one.
struct Atempo {
    tempo: f64,
    sample_rate: u32,
    channels: usize,
    window: Vec<f32>,
    /// Interleaved input not yet consumed.
    pending: Vec<f32>,
    /// Media time of the first frame in `pending`.
    pending_pts: Option<f64>,
    /// Fractional read position into `pending`, in frames.
    read_pos: f64,
    /// Interleaved overlap-add accumulator, `TEMPO_WINDOW` frames long.
    acc: Vec<f32>,
}

impl Atempo {
    fn new(tempo: f64, sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let window = (0..TEMPO_WINDOW)
            .map(|n| {
                let x = 2.0 * std::f32::consts::PI * n as f32 / TEMPO_WINDOW as f32;
                0.5 - 0.5 * x.cos()
            })
            .collect();
        Self {
            tempo,
            sample_rate,
            channels,
            window,
            pending: Vec::new(),
            pending_pts: None,
            read_pos: 0.0,
            acc: vec![0.0; TEMPO_WINDOW * channels],
        }
    }

    fn hop(&self) -> usize {
        TEMPO_WINDOW / 2
    }

    fn stretch(&mut self) -> Option<AudioFrame> {
        let ch = self.channels;
        let hop = self.hop();
        let available = self.pending.len() / ch;
        let start_pts = self.pending_pts? + self.read_pos / self.sample_rate as f64;
        let mut produced = Vec::new();

        while self.read_pos as usize + TEMPO_WINDOW <= available {
            let base = self.read_pos as usize * ch;
            for n in 0..TEMPO_WINDOW {
                let w = self.window[n];
                for c in 0..ch {
                    self.acc[n * ch + c] += self.pending[base + n * ch + c] * w;
                }
            }
            produced.extend_from_slice(&self.acc[..hop * ch]);
            self.acc.copy_within(hop * ch.., 0);
            let tail = self.acc.len() - hop * ch;
            self.acc[tail..].fill(0.0);
            self.read_pos += hop as f64 * self.tempo;
        }

        let consumed = (self.read_pos as usize).min(available);
        if consumed > 0 {
            self.pending.drain(..consumed * ch);
            self.read_pos -= consumed as f64;
            self.pending_pts = self
                .pending_pts
                .map(|pts| pts + consumed as f64 / self.sample_rate as f64);
        }

        if produced.is_empty() {
            return None;
        }
        Some(AudioFrame::new(
            start_pts,
            self.sample_rate,
            ch as u16,
            produced,
        ))
    }
}

impl FilterNode for Atempo {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Audio(a) = frame else {
            out.push(frame);
            return;
        };
        if self.pending.is_empty() {
            self.pending_pts = Some(a.pts);
        }
        self.pending.extend_from_slice(&a.samples);
        if let Some(stretched) = self.stretch() {
            out.push(Frame::Audio(stretched));
        }
    }

    fn flush(&mut self, out: &mut Vec<Frame>) {
        let ch = self.channels;
        let hop = self.hop();
        let Some(pts) = self.pending_pts else {
            return;
        };
        let mut tail = self.acc[..hop * ch].to_vec();
        let remaining = (self.pending.len() / ch).saturating_sub(self.read_pos as usize);
        let keep = ((remaining as f64 / self.tempo) as usize).min(hop);
        tail.truncate(keep * ch);
        self.pending.clear();
        self.pending_pts = None;
        self.read_pos = 0.0;
        self.acc.fill(0.0);
        if !tail.is_empty() {
            out.push(Frame::Audio(AudioFrame::new(pts, self.sample_rate, ch as u16, tail)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::parse_chain;
    use crate::frame::MediaKind;
    use crate::timebase::Timebase;

    fn params(sample_rate: u32, channels: u16) -> SourceParams {
        SourceParams {
            kind: MediaKind::Audio,
            format: FormatKey::Sample { sample_rate, channels },
            width: 0,
            height: 0,
            timebase: Timebase::from_rate(sample_rate),
            frame_rate: None,
        }
    }

    fn node(chain: &str) -> Result<(Box<dyn FilterNode>, SourceParams)> {
        let spec = parse_chain(chain)?.remove(0);
        build(&spec, &params(48_000, 2))
    }

    #[test]
    fn volume_scales_samples() {
        let (mut vol, _) = node("volume=0.5").unwrap();
        let mut out = Vec::new();
        vol.process(Frame::Audio(AudioFrame::new(0.0, 48_000, 2, vec![1.0, -1.0])), &mut out);
        assert_eq!(out[0].clone().into_audio().unwrap().samples, vec![0.5, -0.5]);
    }

    #[test]
    fn volume_accepts_decibels() {
        let gain = parse_gain(Some("-6dB")).unwrap();
        assert!((gain - 0.501).abs() < 0.01);
        assert!(parse_gain(Some("loud")).is_err());
        assert!(parse_gain(Some("-1")).is_err());
    }

    #[test]
    fn atempo_rejects_out_of_range_tempo() {
        assert!(node("atempo=3").is_err());
        assert!(node("atempo").is_err());
        assert!(node("atempo=1.5").is_ok());
    }

    #[test]
    fn atempo_shortens_output_proportionally() {
        let mut stretch = Atempo::new(2.0, 48_000, 1);
        let mut out = Vec::new();
        for i in 0..10 {
            let samples = (0..4_800).map(|n| ((i * 4_800 + n) as f32 * 0.01).sin()).collect();
            stretch.process(Frame::Audio(AudioFrame::new(i as f64 * 0.1, 48_000, 1, samples)), &mut out);
        }
        stretch.flush(&mut out);
        let total: usize = out
            .into_iter()
            .map(|f| f.into_audio().unwrap().frames())
            .sum();
        let ratio = total as f64 / 48_000.0;
        assert!((0.45..=0.55).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn atempo_output_pts_follow_input_time() {
        let mut stretch = Atempo::new(0.5, 48_000, 2);
        let mut out = Vec::new();
        for i in 0..4 {
            stretch.process(
                Frame::Audio(AudioFrame::new(2.0 + i as f64 * 0.1, 48_000, 2, vec![0.2; 9_600])),
                &mut out,
            );
        }
        let pts: Vec<f64> = out.iter().map(|f| f.clone().into_audio().unwrap().pts).collect();
        assert!(!pts.is_empty());
        assert!(pts.windows(2).all(|w| w[0] <= w[1]));
        assert!(pts[0] >= 2.0 && pts[pts.len() - 1] < 2.4);
    }

    #[test]
    fn unknown_filter_is_an_error() {
        assert!(node("hflip").is_err());
    }
}
