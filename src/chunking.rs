//! Chunking utilities for splitting source text into overlapping segments.
//!
//! Text is first normalized (line endings unified, runs of blank lines
//! collapsed, outer whitespace trimmed) and then cut into windows of at most
//! `chunk_size` characters. When a window has to end before the text does,
//! the cut is moved back to the most natural boundary available in the
//! second half of the window: paragraph, line, sentence end, whitespace, and
//! finally a hard character cut. Consecutive windows share exactly
//! `chunk_overlap` characters.
//!
//! All sizes are counted in Unicode scalar values, not bytes.

use crate::{
    error::{Error, Result},
    source::{Chunk, SourceInput, SourceType},
};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 420;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 80;

/// Boundary patterns tried in order of preference. Within one level the
/// rightmost match wins.
const PARAGRAPH: &[&[char]] = &[&['\n', '\n']];
const LINE: &[&[char]] = &[&['\n']];
const SENTENCE: &[&[char]] = &[
    &['。'],
    &['！'],
    &['？'],
    &['.', ' '],
    &['!', ' '],
    &['?', ' '],
];

/// Window size and overlap used when chunking.
///
/// # Examples
///
/// ```
/// use fusionrag::chunking::ChunkingConfig;
///
/// assert!(ChunkingConfig::new(1200, 200).is_ok());
/// assert!(ChunkingConfig::new(100, 100).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks in characters.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be positive".into()));
        }
        if self.overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Normalize raw text before chunking.
///
/// `\r\n` and lone `\r` become `\n`, three or more consecutive newlines
/// collapse to two, and leading/trailing whitespace is removed.
///
/// # Examples
///
/// ```
/// use fusionrag::chunking::normalize_text;
///
/// assert_eq!(normalize_text("a\r\n\r\n\r\n\nb  "), "a\n\nb");
/// ```
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut newlines = 0;

    for c in unified.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(c);
    }

    out.trim().to_string()
}

/// Split `raw_text` into provenance-tagged chunks.
///
/// `chunk_id`s are assigned as a contiguous zero-based sequence. Fails with
/// [`Error::EmptyInput`] when nothing but whitespace remains after
/// normalization.
///
/// # Examples
///
/// ```
/// use fusionrag::{chunking::chunk, source::SourceType};
///
/// let text = "word ".repeat(500);
/// let chunks = chunk(&text, SourceType::TextFile, "words.txt", 1000, 200)
///     .unwrap();
/// assert!(chunks.len() >= 2);
/// assert_eq!(chunks[1].chunk_id(), 1);
/// assert_eq!(chunks[1].source_name(), "words.txt");
/// ```
pub fn chunk(
    raw_text: &str,
    source_type: SourceType,
    source_name: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>> {
    let config = ChunkingConfig::new(chunk_size, chunk_overlap)?;
    let text = normalize_text(raw_text);
    if text.is_empty() {
        return Err(Error::EmptyInput {
            source_name: source_name.to_string(),
        });
    }

    // Map char index -> byte index for O(1) slicing.
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();
    let chars: Vec<char> = text.chars().collect();

    let mut chunks = Vec::new();
    for (start, end) in split_windows(&chars, &config) {
        let window = &text[char_to_byte[start]..char_to_byte[end]];
        if window.trim().is_empty() {
            continue;
        }
        let id = chunks.len();
        chunks.push(Chunk::new(window, source_type, source_name, id)?);
    }

    Ok(chunks)
}

/// Chunk a loaded source with the given configuration.
pub fn chunk_source(
    input: &SourceInput,
    config: &ChunkingConfig,
) -> Result<Vec<Chunk>> {
    chunk(
        &input.text,
        input.source_type,
        &input.source_name,
        config.chunk_size,
        config.overlap,
    )
}

/// Compute `[start, end)` char ranges for each window.
fn split_windows(
    chars: &[char],
    config: &ChunkingConfig,
) -> Vec<(usize, usize)> {
    let len = chars.len();
    let mut windows = Vec::new();
    let mut start = 0;

    loop {
        let hard_end = (start + config.chunk_size).min(len);
        let end = if hard_end < len {
            find_break(chars, start, hard_end, config)
        } else {
            len
        };
        windows.push((start, end));

        if end >= len {
            break;
        }
        // find_break never returns a cut at or before start + overlap.
        start = end - config.overlap;
    }

    windows
}

/// Pick the best cut position in `(start, hard_end]`.
///
/// Only cuts past the window midpoint (and past the overlap) are accepted
/// so chunks stay close to the configured size and the next window always
/// advances.
fn find_break(
    chars: &[char],
    start: usize,
    hard_end: usize,
    config: &ChunkingConfig,
) -> usize {
    let lowest = start + (config.overlap + 1).max(config.chunk_size / 2);
    if lowest > hard_end {
        return hard_end;
    }

    for level in [PARAGRAPH, LINE, SENTENCE] {
        let best = level
            .iter()
            .filter_map(|pattern| {
                rfind_pattern(chars, lowest, hard_end, pattern)
            })
            .max();
        if let Some(cut) = best {
            return cut;
        }
    }

    (lowest..=hard_end)
        .rev()
        .find(|&cut| chars[cut - 1].is_whitespace())
        .unwrap_or(hard_end)
}

/// Rightmost position `cut` in `[lowest, highest]` such that the pattern
/// ends exactly at `cut`.
fn rfind_pattern(
    chars: &[char],
    lowest: usize,
    highest: usize,
    pattern: &[char],
) -> Option<usize> {
    let width = pattern.len();
    (lowest.max(width)..=highest)
        .rev()
        .find(|&cut| chars[cut - width..cut] == *pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(chunks: &[Chunk]) -> Vec<usize> {
        chunks.iter().map(Chunk::chunk_id).collect()
    }

    #[test]
    fn short_text_single_chunk() {
        let chunks =
            chunk("Hello, world!", SourceType::ManualText, "note", 420, 80)
                .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text(), "Hello, world!");
        assert_eq!(chunks[0].chunk_id(), 0);
        assert_eq!(chunks[0].source_type(), SourceType::ManualText);
    }

    #[test]
    fn empty_and_whitespace_input_rejected() {
        for raw in ["", "   \n\n\t  ", "\r\n\r\n"] {
            let err = chunk(raw, SourceType::TextFile, "blank.txt", 420, 80)
                .unwrap_err();
            match err {
                Error::EmptyInput { source_name } => {
                    assert_eq!(source_name, "blank.txt");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn invalid_window_config_rejected() {
        assert!(matches!(
            chunk("abc", SourceType::TextFile, "a", 0, 0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            chunk("abc", SourceType::TextFile, "a", 10, 10),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn three_thousand_chars_make_three_chunks() {
        let text = format!("{}lorem.", "lorem ".repeat(499));
        assert_eq!(text.chars().count(), 3000);

        let chunks =
            chunk(&text, SourceType::TextFile, "lorem.txt", 1200, 200)
                .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(ids(&chunks), vec![0, 1, 2]);
        for c in &chunks {
            assert_eq!(c.source_type(), SourceType::TextFile);
            assert_eq!(c.source_name(), "lorem.txt");
            assert!(c.text().chars().count() <= 1200);
        }
    }

    #[test]
    fn consecutive_chunks_share_overlap() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(80);
        let chunks =
            chunk(&text, SourceType::TextFile, "fox.txt", 300, 50).unwrap();
        assert!(chunks.len() > 3);

        for pair in chunks.windows(2) {
            let head: String = pair[1].text().chars().take(50).collect();
            assert!(
                pair[0].text().ends_with(&head),
                "chunk {} should end with the first 50 chars of chunk {}",
                pair[0].chunk_id(),
                pair[1].chunk_id()
            );
        }
    }

    #[test]
    fn prefers_paragraph_boundary() {
        let first = "a".repeat(70);
        let second = "b".repeat(70);
        let text = format!("{first}\n\n{second} {second}");
        let chunks =
            chunk(&text, SourceType::TextFile, "p.txt", 100, 10).unwrap();
        assert_eq!(chunks[0].text(), format!("{first}\n\n"));
    }

    #[test]
    fn prefers_sentence_end_over_whitespace() {
        let text = format!(
            "{} Done. {} tail words here",
            "x".repeat(60),
            "y".repeat(20)
        );
        let chunks =
            chunk(&text, SourceType::TextFile, "s.txt", 90, 5).unwrap();
        assert!(chunks[0].text().ends_with("Done. "));
    }

    #[test]
    fn japanese_sentence_boundary() {
        let sentence = "これは日本語の文です。";
        let text = sentence.repeat(30);
        let chunks =
            chunk(&text, SourceType::Pdf, "jp.pdf", 50, 10).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks[0].text().ends_with('。'));
    }

    #[test]
    fn hard_cut_without_boundaries() {
        let text = "a".repeat(2500);
        let chunks =
            chunk(&text, SourceType::TextFile, "a.txt", 1000, 200).unwrap();
        assert_eq!(chunks[0].text().len(), 1000);
        assert_eq!(chunks.len(), 3);
        let last = chunks.last().unwrap();
        assert!(text.ends_with(last.text()));
    }

    #[test]
    fn handles_emoji_and_multibyte_chars() {
        let emoji_text = "Hello 👉 world 🌍 test ".repeat(100);
        let chunks =
            chunk(&emoji_text, SourceType::ManualText, "emoji", 200, 50)
                .unwrap();
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text().chars().count() <= 200);
        }
    }

    #[test]
    fn normalize_collapses_blank_runs() {
        assert_eq!(normalize_text("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(normalize_text("a\n\nb"), "a\n\nb");
        assert_eq!(normalize_text("  \r\nx\ry  "), "x\ny");
    }

    #[test]
    fn chunk_source_uses_config() {
        let input =
            SourceInput::new(SourceType::ManualText, "memo", "a b c d e f");
        let config = ChunkingConfig::new(4, 1).unwrap();
        let chunks = chunk_source(&input, &config).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.source_name() == "memo"));
    }
}
