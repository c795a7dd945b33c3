//! Sentence-boundary text chunker with overlap.
//!
//! Splits a page's digital text layer into chunks that respect a configurable
//! `max_tokens` limit. Splitting occurs on sentence and line boundaries to
//! preserve semantic coherence, and consecutive chunks share a configurable
//! overlap so that facts straddling a boundary stay retrievable.

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into overlapping chunks. Returns chunk texts in document order;
/// empty or whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<String> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(CHARS_PER_TOKEN);
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;

    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    let pieces = split_pieces(text, max_chars);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < pieces.len() {
        // Pack pieces until the next one would exceed the budget.
        let mut len = 0usize;
        let mut end = start;
        while end < pieces.len() && (len == 0 || len + pieces[end].len() <= max_chars) {
            len += pieces[end].len();
            end += 1;
        }

        let chunk = pieces[start..end].concat();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= pieces.len() {
            break;
        }

        // Re-include trailing pieces worth up to overlap_chars in the next
        // chunk, always leaving at least one consumed piece behind.
        let mut carried = 0usize;
        let mut next = end;
        while next > start + 1 && carried + pieces[next - 1].len() <= overlap_chars {
            next -= 1;
            carried += pieces[next].len();
        }
        start = next;
    }

    chunks
}

/// Split into sentence-ish pieces, hard-splitting any piece longer than
/// `max_chars` at a word boundary so downstream packing always fits.
fn split_pieces(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    for raw in text.split_inclusive(|c: char| matches!(c, '.' | '!' | '?' | '\n')) {
        if raw.len() <= max_chars {
            pieces.push(raw.to_string());
            continue;
        }
        let mut remaining = raw;
        while remaining.len() > max_chars {
            let cut = floor_char_boundary(remaining, max_chars);
            let split_at = remaining[..cut]
                .rfind(' ')
                .map(|pos| pos + 1)
                .unwrap_or(cut);
            pieces.push(remaining[..split_at].to_string());
            remaining = &remaining[split_at..];
        }
        if !remaining.is_empty() {
            pieces.push(remaining.to_string());
        }
    }
    pieces
}

/// Largest char boundary at or below `index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
