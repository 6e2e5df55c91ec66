//! `aresample` filter.
//!
//! Uses Rubato's streaming sinc resampler to convert interleaved `f32` audio between
//! sample rates. Input is consumed in fixed-size chunks, so the node buffers and emits
//! output as chunks complete; [`FilterNode::flush`] pushes the tail through with a
//! partial chunk.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use super::FilterNode;
use crate::frame::{AudioFrame, Frame};

/// Input chunk size in frames for the steady-state resampling loop.
const CHUNK_FRAMES: usize = 1024;

pub(super) struct ResampleNode {
    resampler: Box<dyn Resampler<f32>>,
    src_rate: u32,
    dst_rate: u32,
    channels: usize,
    pending: Vec<f32>,
    pending_pts: Option<f64>,
    out_interleaved: Vec<f32>,
    indexing: Indexing,
}

impl ResampleNode {
    pub(super) fn new(src_rate: u32, dst_rate: u32, channels: u16) -> Result<Self> {
        let channels = channels.max(1) as usize;
        let f_ratio = dst_rate as f64 / src_rate.max(1) as f64;

        let sinc_len = 128;
        let oversampling_factor = 256;
        let interpolation = SincInterpolationType::Cubic;
        let window = WindowFunction::BlackmanHarris2;
        let f_cutoff = calculate_cutoff(sinc_len, window);

        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        };

        let resampler: Box<dyn Resampler<f32>> = match Async::<f32>::new_sinc(
            f_ratio,
            1.1,
            &params,
            CHUNK_FRAMES,
            channels,
            FixedAsync::Input,
        ) {
            Ok(r) => Box::new(r),
            Err(e) => return Err(anyhow!("resampler init error: {e}")),
        };

        let headroom = (f_ratio * 2.0).ceil().max(3.0) as usize;
        tracing::debug!(src_rate, dst_rate, channels, "aresample configured");

        Ok(Self {
            resampler,
            src_rate,
            dst_rate,
            channels,
            pending: Vec::new(),
            pending_pts: None,
            out_interleaved: vec![0.0f32; channels * CHUNK_FRAMES * headroom],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    /// Resample the first `frames` pending frames. `partial` marks the final short chunk.
    fn run(&mut self, frames: usize, partial: bool) -> Result<Vec<f32>> {
        let channels = self.channels;
        let input = &self.pending[..frames * channels];
        let input_adapter = InterleavedSlice::new(input, channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;

        let out_capacity_frames = self.out_interleaved.len() / channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.out_interleaved, channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        self.indexing.input_offset = 0;
        self.indexing.output_offset = 0;
        self.indexing.partial_len = if partial { Some(frames) } else { None };

        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;

        Ok(self.out_interleaved[..nbr_out * channels].to_vec())
    }

    /// Drop `frames` consumed input frames and emit `samples` as one output frame.
    fn emit(&mut self, frames: usize, samples: Vec<f32>, out: &mut Vec<Frame>) {
        let pts = self.pending_pts.unwrap_or(0.0);
        self.pending.drain(..frames * self.channels);
        self.pending_pts = Some(pts + frames as f64 / self.src_rate.max(1) as f64);
        if !samples.is_empty() {
            out.push(Frame::Audio(AudioFrame::new(
                pts,
                self.dst_rate,
                self.channels as u16,
                samples,
            )));
        }
    }

    /// Pass `frames` pending frames through unresampled after a processing error.
    fn bypass(&mut self, frames: usize, out: &mut Vec<Frame>) {
        let pts = self.pending_pts.unwrap_or(0.0);
        let samples: Vec<f32> = self.pending.drain(..frames * self.channels).collect();
        self.pending_pts = Some(pts + frames as f64 / self.src_rate.max(1) as f64);
        out.push(Frame::Audio(AudioFrame::new(
            pts,
            self.src_rate,
            self.channels as u16,
            samples,
        )));
    }
}

impl FilterNode for ResampleNode {
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) {
        let Frame::Audio(a) = frame else {
            out.push(frame);
            return;
        };
        if self.pending.is_empty() {
            self.pending_pts = Some(a.pts);
        }
        self.pending.extend_from_slice(&a.samples);

        while self.pending.len() >= CHUNK_FRAMES * self.channels {
            match self.run(CHUNK_FRAMES, false) {
                Ok(samples) => self.emit(CHUNK_FRAMES, samples, out),
                Err(e) => {
                    tracing::error!("{e:#}");
                    self.bypass(CHUNK_FRAMES, out);
                }
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<Frame>) {
        let tail_frames = self.pending.len() / self.channels;
        if tail_frames == 0 {
            return;
        }
        match self.run(tail_frames, true) {
            Ok(samples) => self.emit(tail_frames, samples, out),
            Err(e) => {
                tracing::error!("resampler tail {e:#}");
                self.bypass(tail_frames, out);
            }
        }
        self.pending.clear();
        self.pending_pts = None;
    }
}
