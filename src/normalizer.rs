use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::ingest::Review;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use unicode_normalization::{is_nfkc_quick, IsNormalized, UnicodeNormalization};

/// A contiguous slice of one review's normalized text, small enough to
/// embed in a single call. `position` is the chunk's order within its
/// review; consecutive chunks share `overlap` leading/trailing tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub restaurant_id: String,
    pub review_id: String,
    pub text: String,
    pub token_count: usize,
    pub position: usize,
}

/// Unicode-normalizes raw review text and collapses it to single-space
/// separated words. Case is preserved; smart quotes become ASCII, soft
/// hyphens disappear, and control characters turn into spaces.
pub fn clean_text(raw: &str) -> String {
    let normalized: Cow<str> = if is_nfkc_quick(raw.chars()) == IsNormalized::Yes {
        Cow::Borrowed(raw)
    } else {
        Cow::Owned(raw.nfkc().collect())
    };

    let mut out = String::with_capacity(normalized.len());
    let mut pending_space = false;
    for ch in normalized.chars() {
        let mapped = match ch {
            '\u{00ad}' => continue,
            '\u{201c}' | '\u{201d}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            c if c.is_control() => ' ',
            c => c,
        };
        if mapped.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(mapped);
        }
    }
    out
}

/// Stable identity for a review body, used to drop exact duplicates.
/// Case and whitespace differences do not change the fingerprint.
pub fn fingerprint(text: &str) -> String {
    let folded = clean_text(text).to_lowercase();
    let digest = Sha256::digest(folded.as_bytes());
    format!("{digest:x}")
}

fn chunk_id(restaurant_id: &str, review_id: &str, token_offset: usize) -> String {
    let digest = Sha256::digest(format!("{restaurant_id}:{review_id}:{token_offset}").as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Turns raw reviews into embedding-ready chunks. Pure: the same review
/// text always yields the same chunk ids, texts, and positions.
#[derive(Debug, Clone, Copy)]
pub struct TextNormalizer {
    max_tokens: usize,
    overlap_tokens: usize,
    min_tokens_to_chunk: usize,
    min_chunk_tokens: usize,
    min_review_chars: usize,
}

impl TextNormalizer {
    pub fn new(config: &Config) -> Self {
        Self {
            max_tokens: config.chunk_max_tokens,
            overlap_tokens: config.chunk_overlap_tokens,
            min_tokens_to_chunk: config.min_tokens_to_chunk,
            min_chunk_tokens: config.min_chunk_tokens,
            min_review_chars: config.min_review_chars,
        }
    }

    /// Cleans one review and splits it into overlapping token windows.
    ///
    /// Reviews at or under `min_tokens_to_chunk` tokens come back as a
    /// single chunk. Longer ones become windows of at most `max_tokens`
    /// with `overlap_tokens` shared between neighbors; a final window
    /// that would fall under `min_chunk_tokens` is widened backwards so
    /// it ends flush with the text instead of producing a fragment.
    pub fn normalize_and_chunk(&self, review: &Review) -> Result<Vec<Chunk>> {
        let cleaned = clean_text(&review.text);
        if cleaned.is_empty() || cleaned.chars().count() < self.min_review_chars {
            return Err(PipelineError::EmptyInput(review.review_id.clone()));
        }

        let words: Vec<&str> = cleaned.split_whitespace().collect();
        if words.len() <= self.min_tokens_to_chunk {
            let token_count = words.len();
            return Ok(vec![Chunk {
                chunk_id: chunk_id(&review.restaurant_id, &review.review_id, 0),
                restaurant_id: review.restaurant_id.clone(),
                review_id: review.review_id.clone(),
                text: cleaned,
                token_count,
                position: 0,
            }]);
        }

        let step = self.max_tokens - self.overlap_tokens;
        let mut starts = Vec::new();
        let mut start = 0;
        loop {
            starts.push(start);
            if start + self.max_tokens >= words.len() {
                break;
            }
            start += step;
        }

        // A short tail window gets pulled back flush with the end of the
        // text. The widened window still respects max_tokens and never
        // collides with the window before it.
        if let [.., prev, last] = starts.as_slice() {
            if words.len() - last < self.min_chunk_tokens {
                let pulled = words.len() - self.max_tokens;
                if pulled > *prev {
                    let idx = starts.len() - 1;
                    starts[idx] = pulled;
                }
            }
        }

        let chunks = starts
            .iter()
            .enumerate()
            .map(|(position, &start)| {
                let end = (start + self.max_tokens).min(words.len());
                Chunk {
                    chunk_id: chunk_id(&review.restaurant_id, &review.review_id, start),
                    restaurant_id: review.restaurant_id.clone(),
                    review_id: review.review_id.clone(),
                    text: words[start..end].join(" "),
                    token_count: end - start,
                    position,
                }
            })
            .collect();
        Ok(chunks)
    }
}
