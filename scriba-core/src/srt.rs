//! SRT serialization and parsing.
//!
//! `HH:MM:SS,mmm --> HH:MM:SS,mmm` timing lines, entries numbered from 1,
//! one blank line between entries, UTF-8 without BOM. Timestamps truncate
//! to the millisecond; parsing and writing apply the truncation
//! symmetrically so a round trip preserves times exactly.

use crate::error::{Result, ScribaError};
use crate::subtitle::Sentence;

#[derive(Debug, Clone, PartialEq)]
pub struct SrtEntry {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Truncate (not round) to whole milliseconds.
fn to_millis(secs: f64) -> u64 {
    (secs.max(0.0) * 1000.0) as u64
}

pub fn format_timestamp(secs: f64) -> String {
    let ms = to_millis(secs);
    let h = ms / 3_600_000;
    let m = (ms % 3_600_000) / 60_000;
    let s = (ms % 60_000) / 1000;
    let frac = ms % 1000;
    format!("{h:02}:{m:02}:{s:02},{frac:03}")
}

pub fn parse_timestamp(raw: &str) -> Result<f64> {
    let bad = || ScribaError::Protocol(format!("bad SRT timestamp: {raw:?}"));
    let (hms, frac) = raw.trim().split_once(',').ok_or_else(bad)?;
    let mut parts = hms.split(':');
    let h: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let m: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let s: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if parts.next().is_some() || frac.len() != 3 {
        return Err(bad());
    }
    let ms: u64 = frac.parse().map_err(|_| bad())?;
    Ok((h * 3_600_000 + m * 60_000 + s * 1000 + ms) as f64 / 1000.0)
}

/// Serialize committed sentences in index order. One blank line between
/// entries, none after the last.
pub fn serialize(sentences: &[Sentence]) -> String {
    let blocks: Vec<String> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}\n{} --> {}\n{}\n",
                i + 1,
                format_timestamp(s.start),
                format_timestamp(s.end),
                s.text
            )
        })
        .collect();
    blocks.join("\n")
}

/// Parse SRT text into entries. Tolerates CRLF and leading blank lines;
/// rejects malformed timing lines.
pub fn parse(input: &str) -> Result<Vec<SrtEntry>> {
    let normalized = input.replace("\r\n", "\n");
    let mut entries = Vec::new();

    for block in normalized.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty());
        let Some(index_line) = lines.next() else {
            continue;
        };
        let index: usize = index_line
            .trim()
            .trim_start_matches('\u{feff}')
            .parse()
            .map_err(|_| ScribaError::Protocol(format!("bad SRT index line: {index_line:?}")))?;
        let timing = lines
            .next()
            .ok_or_else(|| ScribaError::Protocol("missing SRT timing line".into()))?;
        let (start_raw, end_raw) = timing
            .split_once("-->")
            .ok_or_else(|| ScribaError::Protocol(format!("bad SRT timing line: {timing:?}")))?;
        let start = parse_timestamp(start_raw)?;
        let end = parse_timestamp(end_raw)?;
        let text = lines.collect::<Vec<_>>().join("\n");
        entries.push(SrtEntry {
            index,
            start,
            end,
            text,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subtitle::Sentence;

    fn sentence(index: usize, start: f64, end: f64, text: &str) -> Sentence {
        Sentence::new(index, index, start, end, text.into(), 0.9, vec![])
    }

    #[test]
    fn timestamp_formats_and_truncates() {
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_timestamp(10.0), "00:00:10,000");
        assert_eq!(format_timestamp(3661.5009), "01:01:01,500");
    }

    #[test]
    fn seed_single_sentence_layout() {
        let out = serialize(&[sentence(0, 0.0, 10.0, "你好 世界")]);
        assert_eq!(out, "1\n00:00:00,000 --> 00:00:10,000\n你好 世界\n");
    }

    #[test]
    fn entries_are_separated_by_one_blank_line() {
        let out = serialize(&[
            sentence(0, 0.0, 1.0, "one"),
            sentence(1, 1.0, 2.0, "two"),
        ]);
        assert_eq!(
            out,
            "1\n00:00:00,000 --> 00:00:01,000\none\n\n2\n00:00:01,000 --> 00:00:02,000\ntwo\n"
        );
    }

    #[test]
    fn round_trip_preserves_times_and_text() {
        let sentences = vec![
            sentence(0, 0.0, 2.5, "first line"),
            sentence(1, 2.5, 5.125, "second\nwrapped"),
        ];
        let entries = parse(&serialize(&sentences)).unwrap();
        assert_eq!(entries.len(), 2);
        for (e, s) in entries.iter().zip(&sentences) {
            assert_eq!(e.start, (s.start * 1000.0).trunc() / 1000.0);
            assert_eq!(e.end, (s.end * 1000.0).trunc() / 1000.0);
            assert_eq!(e.text, s.text);
        }
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[1].index, 2);
    }

    #[test]
    fn empty_input_parses_to_no_entries() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("\n\n").unwrap().is_empty());
    }

    #[test]
    fn malformed_timing_is_a_protocol_error() {
        let err = parse("1\n00:00:00,000 -> 00:00:01,000\nhi\n").unwrap_err();
        assert!(matches!(err, ScribaError::Protocol(_)));
        assert!(parse("1\nnot a timing line\nhi\n").is_err());
    }

    #[test]
    fn crlf_input_is_tolerated() {
        let entries = parse("1\r\n00:00:00,500 --> 00:00:01,000\r\nhello\r\n\r\n").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hello");
        assert_eq!(entries[0].start, 0.5);
    }
}
