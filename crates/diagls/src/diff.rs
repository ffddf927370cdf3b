//
// diff.rs
//
// Unified diff parsing: applying patches and mapping hunks to diagnostic ranges
//

use std::sync::OnceLock;

use regex::Regex;
use tower_lsp::lsp_types::{Position, Range};

use crate::utf16::utf16_len;

/// One body line of a hunk, without its prefix character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Removed(String),
    Added(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based start line on the original side
    pub original_start: usize,
    pub original_count: usize,
    /// 1-based start line on the new side
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    /// 0-based index of the first original line the hunk touches.
    ///
    /// A zero-count hunk names the line *after which* it inserts, so
    /// `@@ -0,0 +1,2 @@` starts at index 0 and `@@ -5,0 +6 @@` at index 5.
    fn original_index(&self) -> usize {
        if self.original_count == 0 {
            self.original_start
        } else {
            self.original_start.saturating_sub(1)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    #[error("hunk starting at original line {start} is past the end of the document ({len} lines)")]
    HunkOutOfRange { start: usize, len: usize },
    #[error("hunk starting at original line {start} overlaps the previous hunk")]
    OverlappingHunk { start: usize },
}

fn hunk_header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^@@\s+-(\d+)(?:,(\d+))?\s+\+(\d+)(?:,(\d+))?\s+@@").unwrap()
    })
}

/// Parse `@@ -a,b +c,d @@`. Omitted counts default to 1.
pub fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let caps = hunk_header_pattern().captures(line)?;
    let number = |idx: usize, default: usize| -> Option<usize> {
        match caps.get(idx) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(default),
        }
    };
    Some((number(1, 0)?, number(2, 1)?, number(3, 0)?, number(4, 1)?))
}

/// Split diff text into hunks.
///
/// File headers (`---`/`+++`) are only recognised between hunks: inside a
/// hunk, body lines are classified by their first character until the
/// counts from the header are used up, so an added `++$i;` (`+++$i;`) is
/// still a body line. `\ No newline at end of file` markers and empty
/// lines are skipped. A hunk header that fails to parse drops its body,
/// and body lines before the first valid header are ignored, so a
/// header-less diff yields no hunks at all.
///
/// Lines are split on `\n` only; a `\r` stays part of the line text.
pub fn parse_hunks(diff: &str) -> Vec<Hunk> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut in_hunk = false;
    // original and new side lines still expected by the open hunk
    let mut remaining = (0usize, 0usize);

    for line in diff.split('\n') {
        if line.trim_end_matches('\r').is_empty() || line.starts_with('\\') {
            continue;
        }

        if !in_hunk && (line.starts_with("---") || line.starts_with("+++")) {
            continue;
        }

        if line.starts_with("@@") {
            match parse_hunk_header(line) {
                Some((original_start, original_count, new_start, new_count)) => {
                    hunks.push(Hunk {
                        original_start,
                        original_count,
                        new_start,
                        new_count,
                        lines: Vec::new(),
                    });
                    remaining = (original_count, new_count);
                    in_hunk = remaining != (0, 0);
                }
                None => {
                    log::debug!("Skipping malformed hunk header: {}", line);
                    in_hunk = false;
                }
            }
            continue;
        }

        if !in_hunk {
            continue;
        }
        let Some(hunk) = hunks.last_mut() else {
            continue;
        };

        let mut chars = line.chars();
        let entry = match chars.next() {
            Some(' ') => {
                remaining = (remaining.0.saturating_sub(1), remaining.1.saturating_sub(1));
                HunkLine::Context(chars.as_str().to_string())
            }
            Some('-') => {
                remaining.0 = remaining.0.saturating_sub(1);
                HunkLine::Removed(chars.as_str().to_string())
            }
            Some('+') => {
                remaining.1 = remaining.1.saturating_sub(1);
                HunkLine::Added(chars.as_str().to_string())
            }
            _ => continue,
        };
        hunk.lines.push(entry);
        if remaining == (0, 0) {
            in_hunk = false;
        }
    }

    hunks
}

/// Apply a unified diff to `original`.
///
/// Context lines are taken from the original, not from the diff text.
/// An empty, whitespace-only or header-less diff returns the original
/// unchanged.
pub fn apply(original: &str, diff: &str) -> Result<String, DiffError> {
    if diff.trim().is_empty() {
        return Ok(original.to_string());
    }

    let hunks = parse_hunks(diff);
    if hunks.is_empty() {
        return Ok(original.to_string());
    }

    let lines: Vec<&str> = original.split('\n').collect();
    let mut result: Vec<&str> = Vec::with_capacity(lines.len());
    let mut cursor = 0;

    for hunk in &hunks {
        let start = hunk.original_index();
        if start > lines.len() {
            return Err(DiffError::HunkOutOfRange {
                start: hunk.original_start,
                len: lines.len(),
            });
        }
        if start < cursor {
            return Err(DiffError::OverlappingHunk {
                start: hunk.original_start,
            });
        }

        result.extend_from_slice(&lines[cursor..start]);
        cursor = start;

        for entry in &hunk.lines {
            match entry {
                HunkLine::Context(_) => {
                    if cursor < lines.len() {
                        result.push(lines[cursor]);
                        cursor += 1;
                    }
                }
                HunkLine::Removed(_) => {
                    if cursor < lines.len() {
                        cursor += 1;
                    }
                }
                HunkLine::Added(text) => result.push(text),
            }
        }
    }

    result.extend_from_slice(&lines[cursor..]);
    Ok(result.join("\n"))
}

/// Map a diff onto the ranges in the *original* document that need attention.
///
/// - a removed line spans its own line from column 0 to the trimmed length
///   of its text
/// - a run of added lines not preceded by a removal marks a zero-width
///   insertion point
/// - an addition right after a removal is its replacement and yields nothing
pub fn diagnose(diff: &str) -> Vec<Range> {
    let mut ranges = Vec::new();

    for hunk in parse_hunks(diff) {
        let Ok(mut line) = u32::try_from(hunk.original_index()) else {
            log::debug!("Skipping hunk with out-of-range start {}", hunk.original_start);
            continue;
        };
        let mut after_removal = false;
        let mut in_insertion = false;

        for entry in &hunk.lines {
            match entry {
                HunkLine::Context(_) => {
                    line = line.saturating_add(1);
                    after_removal = false;
                    in_insertion = false;
                }
                HunkLine::Removed(text) => {
                    ranges.push(Range {
                        start: Position::new(line, 0),
                        end: Position::new(line, utf16_len(text.trim())),
                    });
                    line = line.saturating_add(1);
                    after_removal = true;
                    in_insertion = false;
                }
                HunkLine::Added(_) => {
                    if !after_removal && !in_insertion {
                        ranges.push(Range {
                            start: Position::new(line, 0),
                            end: Position::new(line, 0),
                        });
                        in_insertion = true;
                    }
                }
            }
        }
    }

    ranges
}
