//! Sentence-boundary-aware overlapping chunker.
//!
//! Splits parsed page text into [`Chunk`]s of roughly `max_tokens` with a
//! configurable overlap, so cross-boundary context survives extraction.
//! Splitting never breaks mid-sentence unless a single sentence exceeds the
//! window size, in which case it is hard-split at character boundaries.
//!
//! Token counts use a 4 chars ≈ 1 token approximation. Each chunk records
//! its character offsets into the concatenated document text and the page
//! number of its first character; pages without layout metadata produce
//! chunks tagged [`PAGE_UNKNOWN`].

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, PAGE_UNKNOWN};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Text of a single source page, as produced by a parse strategy.
#[derive(Debug, Clone)]
pub struct PageText {
    /// 1-based page number, or [`PAGE_UNKNOWN`] when layout was lost.
    pub page_number: i64,
    pub text: String,
}

impl PageText {
    pub fn new(page_number: i64, text: impl Into<String>) -> Self {
        Self {
            page_number,
            text: text.into(),
        }
    }

    /// Wrap unpaginated text as a single sentinel page.
    pub fn unpaged(text: impl Into<String>) -> Self {
        Self::new(PAGE_UNKNOWN, text)
    }
}

/// Split page text into overlapping sentence-aligned chunks.
///
/// Guarantees:
/// - at least one chunk for non-empty input;
/// - chunk indices contiguous from 0;
/// - consecutive chunks overlap by roughly `overlap_tokens` worth of
///   trailing sentences;
/// - a chunk never starts or ends mid-sentence, except for single
///   sentences longer than the window.
pub fn chunk_pages(
    document_id: &str,
    pages: &[PageText],
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    // Concatenate pages, remembering where each page starts.
    let mut full_text = String::new();
    let mut page_starts: Vec<(usize, i64)> = Vec::new();
    for page in pages {
        if !full_text.is_empty() {
            full_text.push('\n');
        }
        page_starts.push((full_text.len(), page.page_number));
        full_text.push_str(&page.text);
    }

    let sentences = split_sentences(&full_text);
    if sentences.is_empty() {
        return Vec::new();
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut window: Vec<(usize, usize)> = Vec::new();
    let mut window_len = 0usize;
    let mut chunk_index: i64 = 0;

    let flush =
        |window: &[(usize, usize)], chunk_index: &mut i64, chunks: &mut Vec<Chunk>| {
            if window.is_empty() {
                return;
            }
            let start = window[0].0;
            let end = window[window.len() - 1].1;
            let text = full_text[start..end].trim();
            if text.is_empty() {
                return;
            }
            chunks.push(make_chunk(
                document_id,
                *chunk_index,
                text,
                start,
                end,
                page_for_offset(&page_starts, start),
            ));
            *chunk_index += 1;
        };

    let mut i = 0;
    while i < sentences.len() {
        let (start, end) = sentences[i];
        let len = end - start;

        // A single sentence larger than the window is hard-split on its own.
        if len > max_chars {
            flush(&window, &mut chunk_index, &mut chunks);
            window.clear();
            window_len = 0;

            let mut piece_start = start;
            while piece_start < end {
                let mut piece_end = (piece_start + max_chars).min(end);
                piece_end = snap_to_char_boundary(&full_text, piece_end);
                if piece_end <= piece_start {
                    break;
                }
                let text = full_text[piece_start..piece_end].trim();
                if !text.is_empty() {
                    chunks.push(make_chunk(
                        document_id,
                        chunk_index,
                        text,
                        piece_start,
                        piece_end,
                        page_for_offset(&page_starts, piece_start),
                    ));
                    chunk_index += 1;
                }
                piece_start = piece_end;
            }
            i += 1;
            continue;
        }

        if window_len + len > max_chars && !window.is_empty() {
            flush(&window, &mut chunk_index, &mut chunks);

            // Seed the next window with trailing sentences up to the overlap.
            let mut tail: Vec<(usize, usize)> = Vec::new();
            let mut tail_len = 0usize;
            for &(s, e) in window.iter().rev() {
                let slen = e - s;
                if tail_len + slen > overlap_chars {
                    break;
                }
                tail_len += slen;
                tail.push((s, e));
            }
            tail.reverse();
            window = tail;
            window_len = tail_len;
        }

        window.push((start, end));
        window_len += len;
        i += 1;
    }
    flush(&window, &mut chunk_index, &mut chunks);

    chunks
}

/// Byte ranges of sentences in `text`, in order.
///
/// A sentence ends at `.`, `!`, or `?` followed by whitespace, or at a
/// blank line. Whitespace-only ranges are skipped.
pub fn split_sentences(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let b = bytes[i];
        let terminator = matches!(b, b'.' | b'!' | b'?')
            && bytes.get(i + 1).map_or(true, |n| n.is_ascii_whitespace());
        let blank_line = b == b'\n' && bytes.get(i + 1) == Some(&b'\n');

        if terminator || blank_line {
            let end = i + 1;
            push_trimmed(text, start, end, &mut sentences);
            start = end;
        }
        i += 1;
    }
    push_trimmed(text, start, bytes.len(), &mut sentences);

    sentences
}

fn push_trimmed(text: &str, start: usize, end: usize, out: &mut Vec<(usize, usize)>) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = slice.len() - slice.trim_start().len();
    out.push((start + lead, start + lead + trimmed.len()));
}

/// Page number of the page containing `offset`.
fn page_for_offset(page_starts: &[(usize, i64)], offset: usize) -> i64 {
    let mut page = PAGE_UNKNOWN;
    for &(start, number) in page_starts {
        if start > offset {
            break;
        }
        page = number;
    }
    page
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(
    document_id: &str,
    index: i64,
    text: &str,
    start: usize,
    end: usize,
    page_number: i64,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        start_offset: start as i64,
        end_offset: end as i64,
        page_number,
        hash,
    }
}
