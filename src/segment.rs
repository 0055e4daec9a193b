//! Structure-aware markdown segmenter.
//!
//! Splits a document into [`Segment`]s in two passes:
//!
//! 1. **Headings.** Lines starting with one to four `#` followed by a space
//!    open a new section. The heading line stays in the section text and
//!    the stack of enclosing headings becomes the segment's `header_path`.
//!    A section made of only its heading line is folded into a directly
//!    following deeper section. Headings inside fenced code blocks are
//!    ignored.
//! 2. **Size.** Sections longer than `max_size` characters are split
//!    recursively on the first separator that occurs in them
//!    (blank line, newline, sentence end, space, any character), merging
//!    pieces back up to `max_size` with `overlap` characters repeated
//!    between neighbours.
//!
//! Segmenting never fails: if the structural pass cannot produce a result,
//! the whole document is returned as a single segment at depth 0.

use std::collections::VecDeque;
use tracing::warn;

use crate::files::content_hash;
use crate::models::Segment;

pub const DEFAULT_MAX_SIZE: usize = 800;
pub const DEFAULT_OVERLAP: usize = 200;

const MAX_HEADING_LEVEL: usize = 4;
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    max_size: usize,
    overlap: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_OVERLAP)
    }
}

impl Segmenter {
    pub fn new(max_size: usize, overlap: usize) -> Self {
        Self { max_size, overlap }
    }

    pub fn segment(&self, text: &str) -> Vec<Segment> {
        match self.try_segment(text) {
            Ok(segments) => segments,
            Err(reason) => {
                warn!(%reason, "structural segmentation failed, using whole document");
                vec![make_segment(0, text, Vec::new())]
            }
        }
    }

    fn try_segment(&self, text: &str) -> Result<Vec<Segment>, String> {
        if self.max_size == 0 {
            return Err("max_size must be > 0".to_string());
        }
        let overlap = self.overlap.min(self.max_size.saturating_sub(1));

        let mut pieces: Vec<(String, Vec<String>)> = Vec::new();
        for section in split_sections(text) {
            let body = section.text.trim_end();
            if body.trim().is_empty() {
                continue;
            }
            if char_len(body) <= self.max_size {
                pieces.push((body.to_string(), section.header_path));
            } else {
                for part in split_recursive(body, SEPARATORS, self.max_size, overlap) {
                    pieces.push((part, section.header_path.clone()));
                }
            }
        }

        if pieces.is_empty() {
            return Err("no segments produced".to_string());
        }

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(i, (content, path))| make_segment(i as i64, &content, path))
            .collect())
    }
}

/// Segment `text` with explicit size parameters.
pub fn segment_text(text: &str, max_size: usize, overlap: usize) -> Vec<Segment> {
    Segmenter::new(max_size, overlap).segment(text)
}

fn make_segment(ordinal: i64, text: &str, header_path: Vec<String>) -> Segment {
    Segment {
        ordinal,
        content: text.to_string(),
        header_path: header_path.into_iter().filter(|h| !h.is_empty()).collect(),
        hash: content_hash(text),
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

// ============ Heading pass ============

struct Section {
    text: String,
    header_path: Vec<String>,
    /// Depth of the heading that opened this section, 0 for the preamble.
    level: usize,
    /// True while the section holds nothing but its heading line.
    heading_only: bool,
}

/// Parse a heading line, returning its level and title.
fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim();
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > MAX_HEADING_LEVEL {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    Some((level, rest.trim().to_string()))
}

fn is_fence(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("```") || trimmed.starts_with("~~~")
}

fn split_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = Section {
        text: String::new(),
        header_path: Vec::new(),
        level: 0,
        heading_only: false,
    };
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        if is_fence(line) {
            in_fence = !in_fence;
        }
        let heading = if in_fence { None } else { parse_heading(line) };

        match heading {
            Some((level, title)) => {
                while stack.last().is_some_and(|(l, _)| *l >= level) {
                    stack.pop();
                }
                stack.push((level, title));
                let header_path: Vec<String> = stack.iter().map(|(_, t)| t.clone()).collect();

                // A bare parent heading is carried into its first child.
                if current.heading_only && level > current.level {
                    current.text.push_str(line);
                    current.header_path = header_path;
                    current.level = level;
                    continue;
                }

                let finished = std::mem::replace(
                    &mut current,
                    Section {
                        text: line.to_string(),
                        header_path,
                        level,
                        heading_only: true,
                    },
                );
                if !finished.text.trim().is_empty() {
                    sections.push(finished);
                }
            }
            None => {
                if !line.trim().is_empty() {
                    current.heading_only = false;
                }
                current.text.push_str(line);
            }
        }
    }

    if !current.text.trim().is_empty() {
        sections.push(current);
    }
    sections
}

// ============ Size pass ============

/// Split `text` on `sep`, keeping each separator at the start of the
/// piece that follows it.
fn split_keep_separator<'a>(text: &'a str, sep: &str) -> Vec<&'a str> {
    if sep.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(sep) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

fn split_recursive(text: &str, separators: &[&str], max_size: usize, overlap: usize) -> Vec<String> {
    let position = separators
        .iter()
        .position(|s| s.is_empty() || text.contains(s))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let remaining = &separators[(position + 1).min(separators.len())..];

    let mut out = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();

    for piece in split_keep_separator(text, separator) {
        if char_len(piece) <= max_size {
            fitting.push(piece);
            continue;
        }
        if !fitting.is_empty() {
            out.extend(merge_pieces(&fitting, max_size, overlap));
            fitting.clear();
        }
        if remaining.is_empty() {
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        } else {
            out.extend(split_recursive(piece, remaining, max_size, overlap));
        }
    }
    if !fitting.is_empty() {
        out.extend(merge_pieces(&fitting, max_size, overlap));
    }
    out
}

/// Greedily join pieces into chunks of at most `max_size` characters,
/// starting each new chunk with up to `overlap` characters of trailing
/// pieces from the previous one.
fn merge_pieces(pieces: &[&str], max_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        let len = char_len(piece);
        if total + len > max_size && !window.is_empty() {
            push_chunk(&mut chunks, &window);
            while total > overlap || (total + len > max_size && total > 0) {
                match window.pop_front() {
                    Some(front) => total -= char_len(front),
                    None => break,
                }
            }
        }
        window.push_back(piece);
        total += len;
    }
    push_chunk(&mut chunks, &window);
    chunks
}

fn push_chunk(chunks: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(text: &str) -> Vec<&str> {
        text.split_whitespace().collect()
    }

    #[test]
    fn test_heading_sections_with_paths() {
        let text = "# Demo\n\n## Setup\n\nInstall deps\n\n## Run\n\npython main.py";
        let segments = segment_text(text, 800, 200);

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].header_path, vec!["Demo", "Setup"]);
        assert_eq!(segments[1].header_path, vec!["Demo", "Run"]);
        assert_eq!(segments[0].depth(), 2);
        assert!(segments[0].content.contains("# Demo"));
        assert!(segments[0].content.contains("Install deps"));
        assert!(segments[1].content.contains("python main.py"));
        assert_eq!(segments[0].ordinal, 0);
        assert_eq!(segments[1].ordinal, 1);
    }

    #[test]
    fn test_deterministic() {
        let text = "# A\n\nalpha\n\n## B\n\nbeta gamma\n\n### C\n\ndelta";
        let a = segment_text(text, 20, 5);
        let b = segment_text(text, 20, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_dense_ordinals() {
        let text = (0..30)
            .map(|i| format!("## Part {}\n\n{}", i, "word ".repeat(40)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let segments = segment_text(&text, 100, 20);
        for (i, s) in segments.iter().enumerate() {
            assert_eq!(s.ordinal, i as i64);
        }
    }

    #[test]
    fn test_preamble_has_no_headers() {
        let segments = segment_text("intro text\n\n# Title\n\nbody", 800, 200);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].header_path.is_empty());
        assert_eq!(segments[0].depth(), 0);
        assert_eq!(segments[1].header_path, vec!["Title"]);
    }

    #[test]
    fn test_sibling_heading_only_section_is_kept() {
        let segments = segment_text("# One\n\n# Two\n\ntext", 800, 200);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content, "# One");
        assert_eq!(segments[1].header_path, vec!["Two"]);
    }

    #[test]
    fn test_deep_headings_pop_stack() {
        let text = "# A\n\na\n\n## B\n\nb\n\n### C\n\nc\n\n## D\n\nd";
        let segments = segment_text(text, 800, 200);
        let paths: Vec<Vec<String>> = segments.iter().map(|s| s.header_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["A".to_string()],
                vec!["A".to_string(), "B".to_string()],
                vec!["A".to_string(), "B".to_string(), "C".to_string()],
                vec!["A".to_string(), "D".to_string()],
            ]
        );
    }

    #[test]
    fn test_level_five_is_not_a_heading() {
        let segments = segment_text("# A\n\n##### not a split\n\ntext", 800, 200);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].content.contains("##### not a split"));
    }

    #[test]
    fn test_hashtag_is_not_a_heading() {
        let segments = segment_text("# A\n\n#tag in text\n", 800, 200);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_headings_in_code_fence_ignored() {
        let text = "# Script\n\n```bash\n# install\npip install x\n```\n";
        let segments = segment_text(text, 800, 200);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].header_path, vec!["Script"]);
        assert!(segments[0].content.contains("# install"));
    }

    #[test]
    fn test_empty_heading_title_stripped() {
        let segments = segment_text("#\n\nbody under nameless heading", 800, 200);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].header_path.is_empty());
    }

    #[test]
    fn test_long_section_split_with_overlap() {
        let paragraph = (0..60)
            .map(|i| format!("w{:02}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("# Long\n\n{}", paragraph);
        let segments = segment_text(&text, 60, 12);

        assert!(segments.len() > 1);
        for s in &segments {
            assert!(s.content.chars().count() <= 60, "too long: {:?}", s.content);
            assert_eq!(s.header_path, vec!["Long"]);
        }
        // The bare heading splits off first; the body chunks overlap.
        assert_eq!(segments[0].content, "# Long");
        for pair in segments[1..].windows(2) {
            let prev = words(&pair[0].content);
            let next = words(&pair[1].content);
            assert!(prev.iter().any(|w| next.contains(w)));
        }
    }

    #[test]
    fn test_split_preserves_all_words_in_order() {
        let body = (0..200)
            .map(|i| format!("token{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let text = format!("# T\n\n{}\n\nSecond paragraph. With sentences. And more.", body);
        let segments = segment_text(&text, 120, 30);

        let original = words(&text);
        let mut next = 0;
        for s in &segments {
            for w in words(&s.content) {
                // Overlap may repeat earlier words; new words must continue the sequence.
                if next < original.len() && w == original[next] {
                    next += 1;
                }
            }
        }
        assert_eq!(next, original.len(), "lost words after {:?}", original.get(next));
    }

    #[test]
    fn test_hard_split_without_separators() {
        let text = "x".repeat(250);
        let segments = segment_text(&text, 100, 0);
        assert_eq!(segments.len(), 3);
        let total: usize = segments.iter().map(|s| s.content.len()).sum();
        assert_eq!(total, 250);
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "é".repeat(300);
        let segments = segment_text(&text, 100, 10);
        for s in &segments {
            assert!(s.content.chars().count() <= 100);
            assert!(s.content.is_char_boundary(s.content.len()));
        }
    }

    #[test]
    fn test_zero_max_size_falls_back_to_whole_document() {
        let text = "# A\n\nbody";
        let segments = segment_text(text, 0, 0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].content, text);
        assert!(segments[0].header_path.is_empty());
    }

    #[test]
    fn test_empty_document_falls_back() {
        let segments = segment_text("", 800, 200);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].content, "");
        assert_eq!(segments[0].ordinal, 0);
    }

    #[test]
    fn test_hash_is_sha256_of_text() {
        let segments = segment_text("just text", 800, 200);
        assert_eq!(segments[0].hash, content_hash("just text"));
        assert_eq!(segments[0].hash.len(), 64);
    }
}
