//! Video filters: `hflip`, `vflip`, `negate`, `crop`, `fps`.
//!
//! Pixel operations are implemented for packed layouts only; planar input fails
//! validation so the graph falls back to pass-through.

use anyhow::{Result, anyhow, bail};

use super::{FilterNode, FilterSpec, FormatKey, SourceParams};
use crate::frame::{Frame, PixelFormat, VideoFrame};

pub(super) fn build(spec: &FilterSpec, params: &SourceParams) -> Result<(Box<dyn FilterNode>, SourceParams)> {
    let FormatKey::Pixel(format) = params.format else {
        bail!("{}: video filter on non-video input", spec.name);
    };

    match spec.name.as_str() {
        "hflip" => Ok((Box::new(Flip { horizontal: true, bpp: packed_bpp(spec, format)? }), params.clone())),
        "vflip" => Ok((Box::new(Flip { horizontal: false, bpp: packed_bpp(spec, format)? }), params.clone())),
        "negate" => {
            packed_bpp(spec, format)?;
            Ok((Box::new(Negate), params.clone()))
        }
        "crop" => {
            let bpp = packed_bpp(spec, format)?;
            let width = dimension(spec, 0, "w", params.width)?;
            let height = dimension(spec, 1, "h", params.height)?;
            let x = dimension(spec, 2, "x", params.width.saturating_sub(width) / 2)?;
            let y = dimension(spec, 3, "y", params.height.saturating_sub(height) / 2)?;
            let fits = |offset: u32, len: u32, full: u32| offset.checked_add(len).is_some_and(|end| end <= full);
            if width == 0 || height == 0 || !fits(x, width, params.width) || !fits(y, height, params.height) {
                bail!(
                    "crop {width}x{height}+{x}+{y} outside {}x{}",
                    params.width,
                    params.height
                );
            }
            let mut out = params.clone();
            out.width = width;
            out.height = height;
            Ok((Box::new(Crop { x, y, width, height, bpp }), out))
        }
        "fps" => {
            let rate = spec
                .num_arg(0, "fps")?
                .ok_or_else(|| anyhow!("fps: missing rate"))?;
            if !(rate.is_finite() && rate > 0.0 && rate <= 1_000.0) {
                bail!("fps: invalid rate {rate}");
            }
            let mut out = params.clone();
            out.frame_rate = Some(rate);
            Ok((Box::new(Fps::new(rate)), out))
        }
        other => bail!("unknown video filter {other:?}"),
    }
}

fn packed_bpp(spec: &FilterSpec, format: PixelFormat) -> Result<usize> {
    format
        .bytes_per_pixel()
        .ok_or_else(|| anyhow!("{}: unsupported pixel format {format:?}", spec.name))
}

/// A crop size or offset in pixels; `default` when the argument is absent.
fn dimension(spec: &FilterSpec, position: usize, key: &str, default: u32) -> Result<u32> {
    match spec.num_arg(position, key)? {
        Some(v) if v.is_finite() && v >= 0.0 && v <= u32::MAX as f64 => Ok(v as u32),
        Some(v) => bail!("crop: {key} {v} out of range"),
        None => Ok(default),
    }
}

struct Flip {
    horizontal: bool,
    bpp: usize,
}

impl FilterNode for Flip {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Video(mut v) = frame else {
            out.push(frame);
            return;
        };
        let stride = v.width as usize * self.bpp;
        if stride > 0 && v.data.len() % stride == 0 {
            if self.horizontal {
                for row in v.data.chunks_exact_mut(stride) {
                    let pixels = row.len() / self.bpp;
                    for i in 0..pixels / 2 {
                        let j = pixels - 1 - i;
                        for b in 0..self.bpp {
                            row.swap(i * self.bpp + b, j * self.bpp + b);
                        }
                    }
                }
            } else {
                let flipped: Vec<u8> = v.data.chunks_exact(stride).rev().flatten().copied().collect();
                v.data = flipped;
            }
        }
        out.push(Frame::Video(v));
    }
}

struct Negate;

impl FilterNode for Negate {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Video(mut v) = frame else {
            out.push(frame);
            return;
        };
        match v.format {
            PixelFormat::Rgba | PixelFormat::Bgra => {
                for px in v.data.chunks_exact_mut(4) {
                    px[0] = 255 - px[0];
                    px[1] = 255 - px[1];
                    px[2] = 255 - px[2];
                }
            }
            _ => {
                for b in v.data.iter_mut() {
                    *b = 255 - *b;
                }
            }
        }
        out.push(Frame::Video(v));
    }
}

struct Crop {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    bpp: usize,
}

impl FilterNode for Crop {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Video(v) = frame else {
            out.push(frame);
            return;
        };
        let outside = |offset: u32, len: u32, full: u32| offset as u64 + len as u64 > full as u64;
        if !v.is_well_formed() || outside(self.x, self.width, v.width) || outside(self.y, self.height, v.height) {
            out.push(Frame::Video(v));
            return;
        }
        let src_stride = v.width as usize * self.bpp;
        let row_len = self.width as usize * self.bpp;
        let mut data = Vec::with_capacity(row_len * self.height as usize);
        for row in 0..self.height as usize {
            let start = (self.y as usize + row) * src_stride + self.x as usize * self.bpp;
            data.extend_from_slice(&v.data[start..start + row_len]);
        }
        out.push(Frame::Video(VideoFrame::new(
            v.pts,
            v.duration,
            v.format,
            self.width,
            self.height,
            data,
        )));
    }
}

/// Frame-rate conversion onto a fixed output grid.
///
/// Each input frame is held until the next one arrives, then emitted once for every
/// grid slot it covers: frames are duplicated when the output rate is higher and dropped
/// when it is lower.
struct Fps {
    rate: f64,
    next_slot: Option<i64>,
    held: Option<VideoFrame>,
}

impl Fps {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            next_slot: None,
            held: None,
        }
    }

    fn emit_until(&mut self, held: &VideoFrame, end_time: f64, out: &mut Vec<Frame>) {
        let mut slot = self
            .next_slot
            .unwrap_or_else(|| (held.pts * self.rate - 1e-9).ceil() as i64);
        let end = end_time * self.rate - 1e-9;
        while (slot as f64) < end {
            let mut copy = held.clone();
            copy.pts = slot as f64 / self.rate;
            copy.duration = 1.0 / self.rate;
            out.push(Frame::Video(copy));
            slot += 1;
        }
        self.next_slot = Some(slot);
    }
}

impl FilterNode for Fps {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Video(v) = frame else {
            out.push(frame);
            return;
        };
        if let Some(held) = self.held.take() {
            self.emit_until(&held, v.pts, out);
        }
        self.held = Some(v);
    }

    fn flush(&mut self, out: &mut Vec<Frame>) {
        if let Some(held) = self.held.take() {
            let end = held.pts + held.duration;
            self.emit_until(&held, end, out);
        }
        self.next_slot = None;
    }
}
