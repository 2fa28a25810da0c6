//! Reasoning stream decoder
//!
//! Reasoning models interleave a hidden "thinking" segment, wrapped in
//! `<think>` ... `</think>`, with normal content. The decoder splits an
//! incremental text stream into the two channels and keeps a pending buffer
//! across chunk boundaries so a marker split over two network chunks is still
//! recognized. Partial markers are never emitted as visible text.

use serde::{Deserialize, Serialize};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// One decoded piece of model output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "text", rename_all = "lowercase")]
pub enum Segment {
    Thinking(String),
    Content(String),
}

impl Segment {
    pub fn text(&self) -> &str {
        match self {
            Segment::Thinking(t) | Segment::Content(t) => t,
        }
    }

    pub fn is_thinking(&self) -> bool {
        matches!(self, Segment::Thinking(_))
    }
}

/// Incremental `<think>` splitter
#[derive(Debug, Default)]
pub struct ReasoningDecoder {
    in_thinking: bool,
    pending: String,
}

impl ReasoningDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while inside a thinking segment
    pub fn in_thinking(&self) -> bool {
        self.in_thinking
    }

    /// Feed the next chunk, returning every segment that is now safe to emit
    pub fn feed(&mut self, chunk: &str) -> Vec<Segment> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let marker = self.current_marker();
            if let Some(idx) = self.pending.find(marker) {
                let before: String = self.pending[..idx].to_string();
                self.push_segment(&mut out, before);
                self.pending.drain(..idx + marker.len());
                self.in_thinking = !self.in_thinking;
                continue;
            }

            let keep = partial_marker_suffix(&self.pending, marker);
            let emit_len = self.pending.len() - keep;
            if emit_len > 0 {
                let text: String = self.pending.drain(..emit_len).collect();
                self.push_segment(&mut out, text);
            }
            break;
        }

        out
    }

    /// Flush the pending buffer at end of stream
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.push_segment(&mut out, rest);
        out
    }

    fn current_marker(&self) -> &'static str {
        if self.in_thinking {
            THINK_CLOSE
        } else {
            THINK_OPEN
        }
    }

    fn push_segment(&self, out: &mut Vec<Segment>, text: String) {
        if text.is_empty() {
            return;
        }
        if self.in_thinking {
            out.push(Segment::Thinking(text));
        } else {
            out.push(Segment::Content(text));
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`
pub(crate) fn partial_marker_suffix(text: &str, marker: &str) -> usize {
    let max = marker.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| text.ends_with(&marker[..k]))
        .unwrap_or(0)
}

/// Merge adjacent segments of the same channel
pub fn coalesce(segments: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match (out.last_mut(), seg) {
            (Some(Segment::Thinking(prev)), Segment::Thinking(next)) => prev.push_str(&next),
            (Some(Segment::Content(prev)), Segment::Content(next)) => prev.push_str(&next),
            (_, seg) => out.push(seg),
        }
    }
    out
}

/// Decode a complete buffer in one go
pub fn decode_all(text: &str) -> Vec<Segment> {
    let mut decoder = ReasoningDecoder::new();
    let mut segments = decoder.feed(text);
    segments.extend(decoder.finish());
    coalesce(segments)
}

/// Visible content of a complete response, thinking removed
pub fn strip_thinking(text: &str) -> String {
    decode_all(text)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Content(c) => Some(c),
            Segment::Thinking(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Sure.<think>the user wants <b>sum</b></think>def add(a, b):\n    return a + b\n";

    fn decode_split(text: &str, cuts: &[usize]) -> Vec<Segment> {
        let mut decoder = ReasoningDecoder::new();
        let mut segments = Vec::new();
        let mut start = 0;
        for &cut in cuts {
            segments.extend(decoder.feed(&text[start..cut]));
            start = cut;
        }
        segments.extend(decoder.feed(&text[start..]));
        segments.extend(decoder.finish());
        coalesce(segments)
    }

    #[test]
    fn test_single_chunk() {
        let segments = decode_all(SAMPLE);
        assert_eq!(
            segments,
            vec![
                Segment::Content("Sure.".into()),
                Segment::Thinking("the user wants <b>sum</b>".into()),
                Segment::Content("def add(a, b):\n    return a + b\n".into()),
            ]
        );
    }

    #[test]
    fn test_every_split_point_matches_single_chunk() {
        let expected = decode_all(SAMPLE);
        for cut in 1..SAMPLE.len() {
            if !SAMPLE.is_char_boundary(cut) {
                continue;
            }
            assert_eq!(decode_split(SAMPLE, &[cut]), expected, "split at {}", cut);
        }
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let cuts: Vec<usize> = (1..SAMPLE.len()).collect();
        assert_eq!(decode_split(SAMPLE, &cuts), decode_all(SAMPLE));
    }

    #[test]
    fn test_partial_marker_is_held_back() {
        let mut decoder = ReasoningDecoder::new();
        let out = decoder.feed("hello <thi");
        assert_eq!(out, vec![Segment::Content("hello ".into())]);

        let out = decoder.feed("nk>plan");
        assert_eq!(out, vec![Segment::Thinking("plan".into())]);
        assert!(decoder.in_thinking());

        let out = decoder.feed("</");
        assert!(out.is_empty());
        let out = decoder.feed("think>done");
        assert_eq!(out, vec![Segment::Content("done".into())]);
    }

    #[test]
    fn test_unterminated_lookalike_flushed_as_text() {
        let mut decoder = ReasoningDecoder::new();
        let mut out = decoder.feed("a < b and <th");
        out.extend(decoder.finish());
        assert_eq!(coalesce(out), vec![Segment::Content("a < b and <th".into())]);
    }

    #[test]
    fn test_strip_thinking() {
        assert_eq!(strip_thinking("<think>hmm</think>answer"), "answer");
        assert_eq!(strip_thinking("no markers"), "no markers");
    }

    #[test]
    fn test_partial_marker_suffix() {
        assert_eq!(partial_marker_suffix("abc<th", THINK_OPEN), 3);
        assert_eq!(partial_marker_suffix("abc", THINK_OPEN), 0);
        assert_eq!(partial_marker_suffix("<", THINK_CLOSE), 1);
        assert_eq!(partial_marker_suffix("x</think", THINK_CLOSE), 7);
    }
}
