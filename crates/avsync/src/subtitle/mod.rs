//! Subtitle parts and the display timeline.
//!
//! Decoded subtitle events become [`SubtitlePart`]s (see [`assemble_parts`]); parts are stored
//! on a [`SubtitleTimeline`] that answers "what is visible at time `t`".

mod assemble;
mod text;

pub use assemble::{BitmapRegion, SubtitleEvent, SubtitleRect, assemble_parts, composite_regions};
pub use text::{parse_srt, parse_vtt, strip_ass_dialogue, strip_markup};

/// Composited RGBA subtitle image.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtitleImage {
    /// Top-left position on the video canvas.
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Straight-alpha RGBA, row-major, no padding.
    pub rgba: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubtitleContent {
    Text(String),
    Image(SubtitleImage),
}

/// A timed subtitle display interval.
#[derive(Clone, Debug, PartialEq)]
pub struct SubtitlePart {
    pub start: f64,
    /// End time; `f64::INFINITY` until a later part closes it.
    pub end: f64,
    pub content: SubtitleContent,
}

impl SubtitlePart {
    pub fn text(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            content: SubtitleContent::Text(text.into()),
        }
    }

    /// Part that carries nothing; used to clear an open-ended predecessor.
    pub fn empty(start: f64, end: f64) -> Self {
        Self::text(start, end, String::new())
    }

    pub fn is_empty(&self) -> bool {
        match &self.content {
            SubtitleContent::Text(text) => text.is_empty(),
            SubtitleContent::Image(image) => image.rgba.is_empty(),
        }
    }

    pub fn is_open_ended(&self) -> bool {
        self.end.is_infinite()
    }

    pub fn contains(&self, time: f64) -> bool {
        self.start <= time && time < self.end
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            SubtitleContent::Text(text) => Some(text),
            SubtitleContent::Image(_) => None,
        }
    }
}

/// Ordered set of subtitle parts.
#[derive(Debug, Default)]
pub struct SubtitleTimeline {
    parts: Vec<SubtitlePart>,
}

impl SubtitleTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeline pre-filled from a sidecar file.
    pub fn from_parts(parts: impl IntoIterator<Item = SubtitlePart>) -> Self {
        let mut timeline = Self::new();
        for part in parts {
            timeline.insert(part);
        }
        timeline
    }

    /// Insert a part, truncating every open-ended part that started before it.
    ///
    /// Empty parts only close their predecessors and are not stored.
    pub fn insert(&mut self, part: SubtitlePart) {
        for existing in self.parts.iter_mut() {
            if existing.is_open_ended() && existing.start < part.start {
                existing.end = part.start;
            }
        }
        if part.is_empty() {
            return;
        }
        let at = self.parts.partition_point(|p| p.start <= part.start);
        self.parts.insert(at, part);
    }

    /// Non-empty parts visible at `time`.
    pub fn parts_at(&self, time: f64) -> Vec<&SubtitlePart> {
        let upper = self.parts.partition_point(|p| p.start <= time);
        self.parts[..upper]
            .iter()
            .filter(|p| p.contains(time))
            .collect()
    }

    /// Drop parts that ended before `time`.
    pub fn prune_before(&mut self, time: f64) {
        self.parts.retain(|p| p.end >= time);
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubtitlePart> {
        self.parts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_interval_is_visible_only_inside() {
        let mut timeline = SubtitleTimeline::new();
        timeline.insert(SubtitlePart::text(1.0, 2.0, "hello"));
        assert!(timeline.parts_at(0.99).is_empty());
        assert_eq!(timeline.parts_at(1.0).len(), 1);
        assert_eq!(timeline.parts_at(1.99).len(), 1);
        assert!(timeline.parts_at(2.0).is_empty());
    }

    #[test]
    fn open_ended_part_is_closed_by_later_empty_part() {
        let mut timeline = SubtitleTimeline::new();
        timeline.insert(SubtitlePart::text(5.0, f64::INFINITY, "until cleared"));
        assert_eq!(timeline.parts_at(1_000.0).len(), 1);

        timeline.insert(SubtitlePart::empty(8.0, f64::INFINITY));
        assert_eq!(timeline.len(), 1);
        let parts = timeline.parts_at(7.5);
        assert_eq!(parts[0].end, 8.0);
        assert!(timeline.parts_at(8.0).is_empty());
    }

    #[test]
    fn open_ended_part_is_closed_by_next_text() {
        let mut timeline = SubtitleTimeline::new();
        timeline.insert(SubtitlePart::text(0.0, f64::INFINITY, "first"));
        timeline.insert(SubtitlePart::text(3.0, f64::INFINITY, "second"));
        let at_two: Vec<_> = timeline.parts_at(2.0).into_iter().filter_map(SubtitlePart::as_text).collect();
        assert_eq!(at_two, vec!["first"]);
        let at_four: Vec<_> = timeline.parts_at(4.0).into_iter().filter_map(SubtitlePart::as_text).collect();
        assert_eq!(at_four, vec!["second"]);
    }

    #[test]
    fn overlapping_closed_parts_are_both_visible() {
        let timeline = SubtitleTimeline::from_parts([
            SubtitlePart::text(0.0, 5.0, "a"),
            SubtitlePart::text(2.0, 3.0, "b"),
        ]);
        assert_eq!(timeline.parts_at(2.5).len(), 2);
    }

    #[test]
    fn prune_drops_finished_parts() {
        let mut timeline = SubtitleTimeline::from_parts([
            SubtitlePart::text(0.0, 1.0, "a"),
            SubtitlePart::text(2.0, 3.0, "b"),
        ]);
        timeline.prune_before(1.5);
        assert_eq!(timeline.len(), 1);
    }
}
