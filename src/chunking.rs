//! Splitting uploaded documents into overlapping text chunks.
//!
//! The default [`TextSplitter`] is a recursive character splitter: each chunk
//! holds at most `chunk_size` characters and ends, when possible, on the
//! strongest boundary available in its second half (paragraph, line,
//! sentence, then word). Consecutive chunks share roughly `overlap`
//! characters so sentences cut at a boundary keep some context.

use std::path::Path;

use crate::{
    error::{Error, Result},
    extract,
};

/// Default chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Boundaries tried in order when a chunk must be cut.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", " "];

/// Turns raw document bytes into an ordered list of text chunks.
pub trait Chunker: Send + Sync {
    fn chunk(&self, bytes: &[u8]) -> Result<Vec<String>>;

    /// Chunk a document that has been written to disk.
    fn chunk_file(&self, path: &Path) -> Result<Vec<String>> {
        let bytes = std::fs::read(path)?;
        self.chunk(&bytes)
    }
}

/// Character-window splitter for text and PDF documents.
///
/// # Examples
///
/// ```
/// use docubot::chunking::{Chunker, TextSplitter};
///
/// let splitter = TextSplitter::new(1000, 200);
/// let chunks = splitter.chunk(b"Hello, world!").unwrap();
/// assert_eq!(chunks, vec!["Hello, world!".to_string()]);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl TextSplitter {
    /// Overlap is clamped below the chunk size so the window always advances.
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        split_text(text, self.chunk_size, self.overlap)
    }
}

impl Chunker for TextSplitter {
    fn chunk(&self, bytes: &[u8]) -> Result<Vec<String>> {
        let text = extract::document_text(bytes)?;
        Ok(self.split(&text))
    }

    fn chunk_file(&self, path: &Path) -> Result<Vec<String>> {
        let bytes = std::fs::read(path)?;
        let named_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if named_pdf && !extract::is_pdf(&bytes) {
            return Err(Error::Ingest(
                "file is named .pdf but is not a PDF document".into(),
            ));
        }
        self.chunk(&bytes)
    }
}

/// Split `text` into trimmed, non-empty chunks of at most `chunk_size` chars.
pub fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    // (byte offset, char) for every char; char index -> byte offset lookups.
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let char_count = chars.len();
    let byte_at = |idx: usize| chars.get(idx).map_or(text.len(), |(b, _)| *b);

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < char_count {
        let hard_end = (start + chunk_size).min(char_count);
        let end = if hard_end < char_count {
            find_break(text, &chars, start, hard_end)
        } else {
            hard_end
        };

        let piece = text[byte_at(start)..byte_at(end)].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= char_count {
            break;
        }

        // Step back by the overlap, then forward to the start of a word.
        let mut next = end.saturating_sub(overlap).max(start + 1);
        while next < end && !chars[next - 1].1.is_whitespace() {
            next += 1;
        }
        start = next;
    }

    chunks
}

/// Pick the char index to end a chunk spanning `[start, hard_end)`.
///
/// Only the second half of the window is searched so chunks never shrink
/// below half the chunk size because of an early boundary.
fn find_break(
    text: &str,
    chars: &[(usize, char)],
    start: usize,
    hard_end: usize,
) -> usize {
    let floor = start + (hard_end - start) / 2;
    let floor_byte = chars[floor].0;
    let end_byte = chars.get(hard_end).map_or(text.len(), |(b, _)| *b);
    let region = &text[floor_byte..end_byte];

    for sep in SEPARATORS {
        if let Some(pos) = region.rfind(sep) {
            let cut_byte = floor_byte + pos + sep.len();
            let cut = chars.partition_point(|(b, _)| *b < cut_byte);
            if cut > start {
                return cut;
            }
        }
    }

    hard_end
}
