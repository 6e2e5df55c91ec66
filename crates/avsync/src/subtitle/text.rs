//! Text subtitle parsing: SRT and WebVTT sidecars, ASS dialogue lines.

use anyhow::{Context, Result, anyhow, bail};

use super::SubtitlePart;

/// Parse SubRip (`.srt`) text into closed parts.
pub fn parse_srt(input: &str) -> Result<Vec<SubtitlePart>> {
    parse_cues(input).context("parse srt")
}

/// Parse WebVTT (`.vtt`) text into closed parts.
///
/// The `WEBVTT` header (and any header lines such as `Kind:` or `Language:`) is required;
/// `NOTE`, `STYLE` and `REGION` blocks are skipped.
pub fn parse_vtt(input: &str) -> Result<Vec<SubtitlePart>> {
    let body = input.trim_start_matches('\u{feff}').trim_start();
    if !body.starts_with("WEBVTT") {
        bail!("missing WEBVTT header");
    }
    parse_cues(body).context("parse vtt")
}

fn parse_cues(input: &str) -> Result<Vec<SubtitlePart>> {
    let normalized = input.trim_start_matches('\u{feff}').replace("\r\n", "\n").replace('\r', "\n");
    let mut parts = Vec::new();

    for block in normalized.split("\n\n") {
        let lines: Vec<&str> = block.lines().filter(|l| !l.trim().is_empty()).collect();
        let Some(timing_at) = lines.iter().position(|l| l.contains("-->")) else {
            continue;
        };
        let (start, end) = parse_timing(lines[timing_at])
            .with_context(|| format!("cue timing {:?}", lines[timing_at]))?;
        let text = lines[timing_at + 1..]
            .iter()
            .map(|l| strip_markup(l.trim()))
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            continue;
        }
        parts.push(SubtitlePart::text(start, end, text));
    }

    parts.sort_by(|a, b| a.start.total_cmp(&b.start));
    Ok(parts)
}

fn parse_timing(line: &str) -> Result<(f64, f64)> {
    let (start, rest) = line
        .split_once("-->")
        .ok_or_else(|| anyhow!("missing arrow"))?;
    // VTT cue settings follow the end time.
    let end = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("missing end time"))?;
    let start = parse_timestamp(start.trim())?;
    let end = parse_timestamp(end)?;
    if end < start {
        bail!("end {end} before start {start}");
    }
    Ok((start, end))
}

/// Parse `[hh:]mm:ss[,.]mmm` into seconds.
fn parse_timestamp(raw: &str) -> Result<f64> {
    let fields: Vec<&str> = raw.split(':').collect();
    let (hours, minutes, seconds) = match fields.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => ("0", *m, *s),
        _ => bail!("bad timestamp {raw:?}"),
    };
    let hours: u64 = hours.trim().parse().map_err(|_| anyhow!("bad hours in {raw:?}"))?;
    let minutes: u64 = minutes.trim().parse().map_err(|_| anyhow!("bad minutes in {raw:?}"))?;
    let seconds: f64 = seconds
        .trim()
        .replace(',', ".")
        .parse()
        .map_err(|_| anyhow!("bad seconds in {raw:?}"))?;
    Ok(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

/// Remove HTML-like `<...>` tags and ASS `{...}` override blocks.
pub fn strip_markup(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut depth_angle = false;
    let mut depth_brace = false;
    for c in line.chars() {
        match c {
            '<' if !depth_brace => depth_angle = true,
            '>' if depth_angle => depth_angle = false,
            '{' if !depth_angle => depth_brace = true,
            '}' if depth_brace => depth_brace = false,
            _ if depth_angle || depth_brace => {}
            _ => out.push(c),
        }
    }
    out.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&nbsp;", " ")
        .trim()
        .to_string()
}

/// Extract the visible text of an ASS dialogue line.
///
/// Accepts both full `Dialogue: ...` lines (nine leading fields) and the packet form
/// used by decoders (`ReadOrder,Layer,Style,...`, eight leading fields).
pub fn strip_ass_dialogue(raw: &str) -> String {
    let raw = raw.trim();
    let text = match raw.strip_prefix("Dialogue:") {
        Some(rest) => rest.splitn(10, ',').nth(9),
        None => raw.splitn(9, ',').nth(8),
    }
    .unwrap_or(raw);
    let text = text.replace("\\N", "\n").replace("\\n", "\n").replace("\\h", " ");
    text.lines()
        .map(strip_markup)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRT: &str = "1\r\n00:00:01,000 --> 00:00:02,500\r\n<i>Hello</i>\r\n\r\n2\r\n00:00:03,000 --> 00:00:04,000\r\nTwo\r\nlines\r\n\r\n3\r\n01:00:00,000 --> 01:00:01,140\r\n{\\an8}Top\r\n";

    #[test]
    fn parses_srt_cues() {
        let parts = parse_srt(SRT).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].start, 1.0);
        assert_eq!(parts[0].end, 2.5);
        assert_eq!(parts[0].as_text(), Some("Hello"));
        assert_eq!(parts[1].as_text(), Some("Two\nlines"));
        assert!((parts[2].end - 3601.14).abs() < 1e-9);
        assert_eq!(parts[2].as_text(), Some("Top"));
    }

    #[test]
    fn parses_vtt_with_header_lines_and_settings() {
        let vtt = "WEBVTT\nKind: captions\nLanguage: en\n\nNOTE a comment\n\ncue-1\n00:01.000 --> 00:04.000 align:start position:10%\nFirst &amp; only\n\n00:00:05.250 --> 00:00:06.000\n<c.yellow>Second</c>\n";
        let parts = parse_vtt(vtt).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].start, 1.0);
        assert_eq!(parts[0].end, 4.0);
        assert_eq!(parts[0].as_text(), Some("First & only"));
        assert_eq!(parts[1].start, 5.25);
        assert_eq!(parts[1].as_text(), Some("Second"));
    }

    #[test]
    fn vtt_requires_header() {
        assert!(parse_vtt("00:01.000 --> 00:02.000\nx\n").is_err());
    }

    #[test]
    fn bad_timestamp_is_an_error() {
        assert!(parse_srt("1\n00:00:xx,000 --> 00:00:01,000\nbad\n").is_err());
    }

    #[test]
    fn ass_dialogue_text_is_extracted() {
        assert_eq!(
            strip_ass_dialogue("Dialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,Hi\\Nthere"),
            "Hi\nthere"
        );
        assert_eq!(strip_ass_dialogue("3,0,Default,,0,0,0,,{\\b1}Bold{\\b0}, yes"), "Bold, yes");
    }
}
