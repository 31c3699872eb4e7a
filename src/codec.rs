/*!
 # Wire codec

 Outgoing messages are ASCII lines: `R,G,B\n` for color mode or
 `TIMER:<value>\n` for value-only mode. Incoming device output is split into
 newline-delimited lines with trailing carriage returns removed.
*/

use crate::color::rgb_components;
use crate::monitor::TimerSnapshot;

/// Triplet sent when a color is missing or cannot be parsed
pub const FALLBACK_TRIPLET: &str = "0,0,0";

/// Which field of a snapshot goes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireMode {
    /// `R,G,B\n` from the resolved background color
    #[default]
    Color,
    /// `TIMER:<value>\n` from the displayed text
    Timer,
}

impl WireMode {
    /// Builds the framed line for a snapshot
    pub fn frame(&self, snapshot: &TimerSnapshot) -> String {
        match self {
            WireMode::Color => frame_color(Some(snapshot.color.as_str())),
            WireMode::Timer => frame_timer(&snapshot.value),
        }
    }
}

/// Converts color text into a comma-joined decimal triplet.
///
/// Takes the first three numeric tokens as red, green and blue. Absent or
/// unparseable input yields `"0,0,0"`.
pub fn color_triplet(color: Option<&str>) -> String {
    match color.and_then(rgb_components) {
        Some([r, g, b]) => format!("{},{},{}", r, g, b),
        None => FALLBACK_TRIPLET.to_string(),
    }
}

/// `R,G,B\n`
pub fn frame_color(color: Option<&str>) -> String {
    let mut line = color_triplet(color);
    line.push('\n');
    line
}

/// `TIMER:<value>\n`
pub fn frame_timer(value: &str) -> String {
    format!("TIMER:{}\n", value)
}

/// Decodes bytes as UTF-8 and strips trailing NUL padding
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// Splits a byte stream into lines across arbitrary chunk boundaries.
///
/// The trailing fragment without a terminator stays buffered until a later
/// chunk completes it. Splitting happens on raw bytes so multi-byte UTF-8
/// sequences cut by a chunk boundary are reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every completed, non-empty line
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let mut line = &raw[..raw.len() - 1];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(line).into_owned());
            }
        }
        lines
    }

    /// Bytes received after the last terminator
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorValue;
    use regex::Regex;

    #[test]
    fn test_well_formed_colors_frame_as_triplets() {
        let shape = Regex::new(r"^\d{1,3},\d{1,3},\d{1,3}\n$").unwrap();
        for css in [
            "rgb(0, 128, 0)",
            "rgb(255,255,255)",
            "rgba(12, 34, 56, 0.5)",
            "rgba(0, 0, 0, 0)",
        ] {
            let line = frame_color(Some(css));
            assert!(shape.is_match(&line), "{css:?} framed as {line:?}");
        }
        assert_eq!(frame_color(Some("rgb(0, 128, 0)")), "0,128,0\n");
    }

    #[test]
    fn test_malformed_colors_fall_back_to_black() {
        assert_eq!(frame_color(None), "0,0,0\n");
        assert_eq!(frame_color(Some("")), "0,0,0\n");
        assert_eq!(frame_color(Some("transparent")), "0,0,0\n");
        assert_eq!(frame_color(Some("rgb(1, 2)")), "0,0,0\n");
        assert_eq!(frame_color(Some("rgb(999, 0, 0)")), "0,0,0\n");
    }

    #[test]
    fn test_wire_modes() {
        let snapshot = TimerSnapshot {
            value: "01:06".to_string(),
            color: ColorValue::parse("rgb(255, 0, 0)"),
        };
        assert_eq!(WireMode::Color.frame(&snapshot), "255,0,0\n");
        assert_eq!(WireMode::Timer.frame(&snapshot), "TIMER:01:06\n");
    }

    #[test]
    fn test_decode_text_strips_nul_padding() {
        assert_eq!(decode_text(b"v1.2\0\0\0"), "v1.2");
        assert_eq!(decode_text(b""), "");
    }

    #[test]
    fn test_framer_keeps_incomplete_tail() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.push(b"OK\r\nPONG"), vec!["OK".to_string()]);
        assert_eq!(framer.pending(), b"PONG");
        assert_eq!(framer.push(b"\r\n"), vec!["PONG".to_string()]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_framer_skips_empty_lines_and_joins_split_utf8() {
        let mut framer = LineFramer::new();
        assert!(framer.push(b"\n\r\n").is_empty());

        let bytes = "t\u{e9}st\n".as_bytes();
        assert!(framer.push(&bytes[..2]).is_empty());
        assert_eq!(framer.push(&bytes[2..]), vec!["t\u{e9}st".to_string()]);
    }
}
