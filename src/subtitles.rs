//! Subtitle timing assembly and serialization
//!
//! Offsets are integer milliseconds. Cues are half-open intervals `[start, end)`, so a
//! cue ending exactly where the next one starts does not overlap it.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::task::SubtitleFormat;

/// Minimal time unit (1 ms)
pub const MIN_UNIT_MS: u64 = 1;

/// A timed piece of text produced by the transcriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedSegment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl TimedSegment {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// One numbered subtitle entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cue {
    /// 1-based position in the document
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtitleDocument {
    pub cues: Vec<Cue>,
}

impl SubtitleDocument {
    pub fn is_empty(&self) -> bool {
        self.cues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cues.len()
    }

    pub fn render(&self, format: SubtitleFormat) -> String {
        match format {
            SubtitleFormat::Srt => self.to_srt(),
            SubtitleFormat::WebVtt => self.to_webvtt(),
        }
    }

    pub fn to_srt(&self) -> String {
        let mut out = String::new();
        for cue in &self.cues {
            let _ = write!(
                out,
                "{}\n{} --> {}\n{}\n\n",
                cue.index,
                format_timestamp(cue.start_ms, ','),
                format_timestamp(cue.end_ms, ','),
                cue.text
            );
        }
        out
    }

    pub fn to_webvtt(&self) -> String {
        let mut out = String::from("WEBVTT\n\n");
        for cue in &self.cues {
            let _ = write!(
                out,
                "{}\n{} --> {}\n{}\n\n",
                cue.index,
                format_timestamp(cue.start_ms, '.'),
                format_timestamp(cue.end_ms, '.'),
                cue.text
            );
        }
        out
    }
}

/// `HH:MM:SS<sep>mmm`
pub fn format_timestamp(ms: u64, millis_separator: char) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!(
        "{:02}:{:02}:{:02}{}{:03}",
        hours, minutes, seconds, millis_separator, millis
    )
}

/// Turns transcriber segments into a valid subtitle document
#[derive(Debug, Clone)]
pub struct SubtitleAssembler {
    /// Display floor applied to short cues
    pub min_duration_ms: u64,
}

impl SubtitleAssembler {
    pub fn new(min_duration_ms: u64) -> Self {
        Self { min_duration_ms }
    }

    pub fn assemble(&self, segments: &[TimedSegment]) -> SubtitleDocument {
        let mut sorted: Vec<&TimedSegment> = segments.iter().collect();
        // stable: equal starts keep emission order
        sorted.sort_by_key(|s| s.start_ms);

        // Resolve overlaps against the cue that follows
        let mut kept: Vec<TimedSegment> = Vec::with_capacity(sorted.len());
        for segment in sorted {
            while let Some(last) = kept.last_mut() {
                if last.end_ms <= segment.start_ms {
                    break;
                }
                if segment.start_ms <= last.start_ms {
                    // truncation would leave nothing to display
                    kept.pop();
                } else {
                    last.end_ms = segment.start_ms;
                    break;
                }
            }
            kept.push(segment.clone());
        }

        // Extend short cues up to the next start
        for i in 0..kept.len() {
            if kept[i].duration_ms() >= self.min_duration_ms {
                continue;
            }
            let mut end = kept[i].start_ms.saturating_add(self.min_duration_ms);
            if let Some(next) = kept.get(i + 1) {
                end = end.min(next.start_ms);
            }
            if end > kept[i].end_ms {
                kept[i].end_ms = end;
            }
        }

        let cues = kept
            .into_iter()
            .enumerate()
            .map(|(i, s)| Cue {
                index: i + 1,
                start_ms: s.start_ms,
                end_ms: s.end_ms,
                text: s.text,
            })
            .collect();

        SubtitleDocument { cues }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: u64, end: u64, text: &str) -> TimedSegment {
        TimedSegment::new(start, end, text)
    }

    fn assert_valid(doc: &SubtitleDocument) {
        for pair in doc.cues.windows(2) {
            assert!(pair[0].start_ms < pair[1].start_ms, "not strictly ordered: {:?}", pair);
            assert!(pair[0].end_ms <= pair[1].start_ms, "overlap: {:?}", pair);
        }
        for (i, cue) in doc.cues.iter().enumerate() {
            assert_eq!(cue.index, i + 1);
            assert!(cue.end_ms > cue.start_ms);
        }
    }

    #[test]
    fn test_overlap_truncates_earlier_cue() {
        let assembler = SubtitleAssembler::new(1000);
        let doc = assembler.assemble(&[
            seg(0, 2000, "a"),
            seg(1000, 3000, "b"),
            seg(5000, 6000, "c"),
        ]);

        assert_eq!(
            doc.cues,
            vec![
                Cue { index: 1, start_ms: 0, end_ms: 1000, text: "a".into() },
                Cue { index: 2, start_ms: 1000, end_ms: 3000, text: "b".into() },
                Cue { index: 3, start_ms: 5000, end_ms: 6000, text: "c".into() },
            ]
        );
    }

    #[test]
    fn test_same_start_drops_earlier_cue() {
        let assembler = SubtitleAssembler::new(500);
        let doc = assembler.assemble(&[seg(1000, 3000, "first"), seg(1000, 2000, "second")]);
        assert_eq!(doc.len(), 1);
        assert_eq!(doc.cues[0].text, "second");
        assert_eq!(doc.cues[0].index, 1);
    }

    #[test]
    fn test_unsorted_input_is_ordered() {
        let assembler = SubtitleAssembler::new(100);
        let doc = assembler.assemble(&[seg(4000, 5000, "late"), seg(0, 1000, "early")]);
        assert_eq!(doc.cues[0].text, "early");
        assert_eq!(doc.cues[1].text, "late");
        assert_valid(&doc);
    }

    #[test]
    fn test_short_cue_extended_up_to_next_start() {
        let assembler = SubtitleAssembler::new(1000);
        let doc = assembler.assemble(&[seg(0, 200, "short"), seg(600, 2000, "next"), seg(3000, 3100, "tail")]);

        assert_eq!(doc.cues[0].end_ms, 600);
        assert_eq!(doc.cues[1].end_ms, 2000);
        // last cue is unconstrained
        assert_eq!(doc.cues[2].end_ms, 4000);
        assert_valid(&doc);
    }

    #[test]
    fn test_minimum_duration_holds_unless_constrained() {
        let assembler = SubtitleAssembler::new(800);
        let segments = vec![
            seg(0, 100, "a"),
            seg(50, 400, "b"),
            seg(2000, 2100, "c"),
            seg(2300, 5000, "d"),
            seg(4000, 4200, "e"),
            seg(9000, 9001, "f"),
        ];
        let doc = assembler.assemble(&segments);
        assert_valid(&doc);

        for (i, cue) in doc.cues.iter().enumerate() {
            let duration = cue.end_ms - cue.start_ms;
            match doc.cues.get(i + 1) {
                Some(next) if cue.start_ms + 800 > next.start_ms => {
                    assert_eq!(cue.end_ms, next.start_ms)
                }
                _ => assert!(duration >= 800, "cue {:?} too short", cue),
            }
        }
    }

    #[test]
    fn test_chained_overlaps_resolve() {
        let assembler = SubtitleAssembler::new(1);
        let doc = assembler.assemble(&[
            seg(0, 10_000, "long"),
            seg(1000, 9000, "mid"),
            seg(2000, 3000, "inner"),
        ]);
        assert_valid(&doc);
        assert_eq!(doc.cues[0].end_ms, 1000);
        assert_eq!(doc.cues[1].end_ms, 2000);
        assert_eq!(doc.cues[2].end_ms, 3000);
    }

    #[test]
    fn test_empty_input_gives_empty_document() {
        let doc = SubtitleAssembler::new(1000).assemble(&[]);
        assert!(doc.is_empty());
        assert_eq!(doc.to_srt(), "");
        assert_eq!(doc.to_webvtt(), "WEBVTT\n\n");
    }

    #[test]
    fn test_short_cue_near_time_limit_does_not_overflow() {
        let doc = SubtitleAssembler::new(1000).assemble(&[seg(u64::MAX - 10, u64::MAX - 5, "end")]);
        assert_eq!(doc.cues.len(), 1);
        assert_eq!(doc.cues[0].end_ms, u64::MAX);
        assert_valid(&doc);
    }

    #[test]
    fn test_srt_rendering() {
        let doc = SubtitleAssembler::new(1).assemble(&[
            seg(1500, 3_725_042, "Hello there"),
        ]);
        assert_eq!(doc.to_srt(), "1\n00:00:01,500 --> 01:02:05,042\nHello there\n\n");
        assert!(doc.to_webvtt().contains("00:00:01.500 --> 01:02:05.042"));
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(0, ','), "00:00:00,000");
        assert_eq!(format_timestamp(59_999, ','), "00:00:59,999");
        assert_eq!(format_timestamp(36_000_001, '.'), "10:00:00.001");
    }
}
