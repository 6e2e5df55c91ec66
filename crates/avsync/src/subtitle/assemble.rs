//! Decoded subtitle events → timed parts.

use super::{SubtitleContent, SubtitleImage, SubtitlePart};
use super::text::strip_ass_dialogue;

/// One RGBA bitmap region of a decoded subtitle event.
#[derive(Clone, Debug, PartialEq)]
pub struct BitmapRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Straight-alpha RGBA, `width * height * 4` bytes.
    pub rgba: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubtitleRect {
    Bitmap(BitmapRegion),
    /// Plain text.
    Text(String),
    /// An ASS dialogue line, override tags included.
    Ass(String),
}

/// Output of a subtitle decoder for one packet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubtitleEvent {
    /// Display start, relative to the packet timestamp.
    pub start_display_ms: u32,
    /// Display end relative to the packet timestamp, when the codec specifies one.
    pub end_display_ms: Option<u32>,
    pub rects: Vec<SubtitleRect>,
}

/// Turn a decoded event into timeline parts.
///
/// - start = packet time + display start, shifted back by `stream_start` when the start
///   is at or after it;
/// - end = the event's explicit end, else the packet duration, else `+inf`;
/// - bitmap regions are composited into one image, text regions joined into one string;
/// - an event with no content still yields one empty part so that it can close an
///   open-ended predecessor.
pub fn assemble_parts(
    event: &SubtitleEvent,
    packet_pts: f64,
    packet_duration: f64,
    stream_start: f64,
) -> Vec<SubtitlePart> {
    let mut start = packet_pts + event.start_display_ms as f64 / 1000.0;
    if stream_start.is_finite() && start >= stream_start {
        start -= stream_start;
    }

    let explicit = event
        .end_display_ms
        .filter(|end| *end > event.start_display_ms)
        .map(|end| (end - event.start_display_ms) as f64 / 1000.0);
    let duration = match explicit {
        Some(d) => d,
        None if packet_duration.is_finite() && packet_duration > 0.0 => packet_duration,
        None => f64::INFINITY,
    };
    let end = start + duration;

    let mut regions = Vec::new();
    let mut text = String::new();
    for rect in &event.rects {
        let line = match rect {
            SubtitleRect::Bitmap(region) => {
                regions.push(region);
                continue;
            }
            SubtitleRect::Text(t) => t.trim_end().to_string(),
            SubtitleRect::Ass(raw) => strip_ass_dialogue(raw),
        };
        if line.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&line);
    }

    let mut parts = Vec::new();
    if let Some(image) = composite_regions(&regions) {
        parts.push(SubtitlePart {
            start,
            end,
            content: SubtitleContent::Image(image),
        });
    }
    if !text.is_empty() {
        parts.push(SubtitlePart::text(start, end, text));
    }
    if parts.is_empty() {
        parts.push(SubtitlePart::empty(start, end));
    }
    parts
}

/// Largest composited canvas side, in pixels.
const MAX_CANVAS_SIDE: u64 = 8192;

/// Far edge of a region along one axis, measured from the canvas origin.
fn extent(origin: i32, len: u32) -> u64 {
    origin.max(0) as u64 + len as u64
}

fn is_drawable(r: &BitmapRegion) -> bool {
    let expected = (r.width as u64)
        .checked_mul(r.height as u64)
        .and_then(|px| px.checked_mul(4));
    if r.width == 0 || r.height == 0 || expected != Some(r.rgba.len() as u64) {
        return false;
    }
    if extent(r.x, r.width) > MAX_CANVAS_SIDE || extent(r.y, r.height) > MAX_CANVAS_SIDE {
        tracing::warn!(
            x = r.x,
            y = r.y,
            width = r.width,
            height = r.height,
            "subtitle region outside the canvas limit, dropped"
        );
        return false;
    }
    true
}

/// Alpha-composite bitmap regions into a single image.
///
/// A single region keeps its position. Several regions are drawn in order onto a canvas
/// anchored at the origin and covering all of them. Regions reaching past
/// `MAX_CANVAS_SIDE` on either axis are dropped.
pub fn composite_regions(regions: &[&BitmapRegion]) -> Option<SubtitleImage> {
    let valid: Vec<&BitmapRegion> = regions.iter().copied().filter(|r| is_drawable(r)).collect();

    match valid.as_slice() {
        [] => None,
        [only] => Some(SubtitleImage {
            x: only.x,
            y: only.y,
            width: only.width,
            height: only.height,
            rgba: only.rgba.clone(),
        }),
        many => {
            // Bounded by MAX_CANVAS_SIDE, so the casts and the product cannot overflow.
            let width = many.iter().map(|r| extent(r.x, r.width)).max().unwrap_or(0) as u32;
            let height = many.iter().map(|r| extent(r.y, r.height)).max().unwrap_or(0) as u32;
            let mut canvas = vec![0u8; width as usize * height as usize * 4];
            for region in many {
                blend_onto(&mut canvas, width, region);
            }
            Some(SubtitleImage {
                x: 0,
                y: 0,
                width,
                height,
                rgba: canvas,
            })
        }
    }
}

/// Source-over blend of straight-alpha `region` onto `canvas`.
fn blend_onto(canvas: &mut [u8], canvas_width: u32, region: &BitmapRegion) {
    let ox = region.x.max(0) as usize;
    let oy = region.y.max(0) as usize;
    let cw = canvas_width as usize;
    for row in 0..region.height as usize {
        for col in 0..region.width as usize {
            let src = (row * region.width as usize + col) * 4;
            let dst = ((oy + row) * cw + ox + col) * 4;
            let sa = region.rgba[src + 3] as f32 / 255.0;
            if sa <= 0.0 {
                continue;
            }
            let da = canvas[dst + 3] as f32 / 255.0;
            let out_a = sa + da * (1.0 - sa);
            for c in 0..3 {
                let sc = region.rgba[src + c] as f32;
                let dc = canvas[dst + c] as f32;
                let v = (sc * sa + dc * da * (1.0 - sa)) / out_a;
                canvas[dst + c] = v.round().clamp(0.0, 255.0) as u8;
            }
            canvas[dst + 3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
}
