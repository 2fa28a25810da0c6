//! Line-range selections
//!
//! A selection narrows an improvement to `[start, end]` (1-based, inclusive).
//! The generated replacement is spliced back into the whole file before it is
//! validated or written.

use anyhow::{bail, Result};

use crate::pipeline::LineRange;

fn check_range(lines: &[&str], range: LineRange) -> Result<()> {
    if range.start == 0 || range.end < range.start {
        bail!("invalid line range {}", range);
    }
    if range.end > lines.len() {
        bail!("line range {} is outside the file ({} lines)", range, lines.len());
    }
    Ok(())
}

/// Text of lines `[start, end]`, line endings preserved
pub fn extract_lines(content: &str, range: LineRange) -> Result<String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    check_range(&lines, range)?;
    Ok(lines[range.start - 1..range.end].concat())
}

/// Replace lines `[start, end]` of `content` with `replacement`.
///
/// Splicing the exact text returned by [`extract_lines`] gives back `content`
/// unchanged.
pub fn splice_lines(content: &str, range: LineRange, replacement: &str) -> Result<String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    check_range(&lines, range)?;

    let mut out = String::with_capacity(content.len() + replacement.len());
    out.push_str(&lines[..range.start - 1].concat());
    out.push_str(replacement);

    if !replacement.is_empty() {
        let replaced_line_ended = lines[range.end - 1].ends_with('\n');
        out.push_str(&match_final_newline(replacement, replaced_line_ended));
    }
    let rest = lines[range.end..].concat();
    out.push_str(&rest);
    Ok(out)
}

/// `text` ending in a newline exactly when `ended` is set
pub fn match_final_newline(text: &str, ended: bool) -> String {
    if ended {
        if text.ends_with('\n') {
            text.to_string()
        } else {
            format!("{}\n", text)
        }
    } else {
        text.strip_suffix("\r\n")
            .or_else(|| text.strip_suffix('\n'))
            .unwrap_or(text)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "import os\n\ndef a():\n    return 1\n\ndef b():\n    return 2\n";

    #[test]
    fn test_extract_lines() {
        let selected = extract_lines(FILE, LineRange::new(3, 4)).unwrap();
        assert_eq!(selected, "def a():\n    return 1\n");
    }

    #[test]
    fn test_identical_splice_is_identity() {
        for start in 1..=7 {
            for end in start..=7 {
                let range = LineRange::new(start, end);
                let selected = extract_lines(FILE, range).unwrap();
                assert_eq!(splice_lines(FILE, range, &selected).unwrap(), FILE);
            }
        }

        // also without a trailing newline
        let file = "a\nb\nc";
        let selected = extract_lines(file, LineRange::new(2, 3)).unwrap();
        assert_eq!(splice_lines(file, LineRange::new(2, 3), &selected).unwrap(), file);
    }

    #[test]
    fn test_splice_replacement_without_newline() {
        let out = splice_lines(FILE, LineRange::new(3, 4), "def a():\n    return 10").unwrap();
        assert_eq!(out, "import os\n\ndef a():\n    return 10\n\ndef b():\n    return 2\n");

        let out = splice_lines(FILE, LineRange::new(6, 7), "def b():\n    return 20").unwrap();
        assert!(out.ends_with("return 20\n"));
    }

    #[test]
    fn test_last_line_keeps_missing_newline() {
        let file = "a\nb\nc";
        assert_eq!(splice_lines(file, LineRange::new(3, 3), "c\n").unwrap(), file);
        assert_eq!(splice_lines(file, LineRange::new(2, 3), "B\nC\n").unwrap(), "a\nB\nC");
        // earlier lines still end in a newline
        assert_eq!(splice_lines(file, LineRange::new(1, 1), "A").unwrap(), "A\nb\nc");
    }

    #[test]
    fn test_match_final_newline() {
        assert_eq!(match_final_newline("x\n", false), "x");
        assert_eq!(match_final_newline("x\r\n", false), "x");
        assert_eq!(match_final_newline("x", true), "x\n");
        assert_eq!(match_final_newline("x\n", true), "x\n");
    }

    #[test]
    fn test_range_outside_file() {
        assert!(extract_lines(FILE, LineRange::new(5, 40)).is_err());
        assert!(splice_lines(FILE, LineRange::new(8, 8), "x").is_err());
    }
}
