//! Ordered token sequence with media-chunk placeholders.
//!
//! A [`TokenBuffer`] backs both a slot's prompt and its mirror of the
//! runtime's KV cache contents. Positions occupied by an image/audio chunk
//! hold [`NULL_TOKEN`] and are recorded in a side table keyed by the
//! chunk's starting position, so truncation can refuse to split a chunk.

use std::collections::HashMap;

use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::mtmd::{MtmdContext, MtmdInputChunk, MtmdInputChunkType, MtmdInputChunks};
use llama_cpp_2::token::LlamaToken;

use crate::error::{CoreError, Result};

/// Sentinel occupying a placeholder position owned by a media chunk.
pub const NULL_TOKEN: LlamaToken = LlamaToken::new(-1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
}

/// A decoded media chunk occupying `n_pos` contiguous placeholder slots.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub hash_id: String,
    pub kind: MediaKind,
    pub n_pos: usize,
}

/// Ordered token sequence plus `{start_pos -> media chunk metadata}`. The
/// evaluated `MtmdInputChunk`s themselves live in the slot until the
/// scheduler front-loads them with [`eval_mtmd_chunks`]; this buffer only
/// tracks position bookkeeping, so it never needs to own one.
#[derive(Debug, Default, Clone)]
pub struct TokenBuffer {
    tokens: Vec<LlamaToken>,
    media: HashMap<usize, MediaChunk>,
}

impl TokenBuffer {
    pub fn new() -> Self {
        Self { tokens: Vec::new(), media: HashMap::new() }
    }

    pub fn from_tokens(tokens: Vec<LlamaToken>) -> Self {
        Self { tokens, media: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether this buffer owns any media chunk, i.e. came from an mtmd
    /// tokenization rather than a plain text prompt.
    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    pub fn as_slice(&self) -> &[LlamaToken] {
        &self.tokens
    }

    pub fn append(&mut self, token: LlamaToken) {
        self.tokens.push(token);
    }

    pub fn append_all(&mut self, tokens: &[LlamaToken]) {
        self.tokens.extend_from_slice(tokens);
    }

    /// Whether the token at `pos` is a placeholder owned by a media chunk.
    pub fn is_placeholder(&self, pos: usize) -> bool {
        self.tokens.get(pos) == Some(&NULL_TOKEN)
    }

    /// Delete positions `[keep, keep+discard)` and compact the tail.
    /// No-op if `discard <= 0` or the buffer is too short. Media chunk
    /// start positions above the discarded range are shifted down.
    pub fn shift(&mut self, keep: usize, discard: usize) {
        if discard == 0 || self.tokens.len() < keep + discard {
            return;
        }
        self.tokens.drain(keep..keep + discard);

        let mut shifted = HashMap::with_capacity(self.media.len());
        for (start, entry) in self.media.drain() {
            if start < keep {
                shifted.insert(start, entry);
            } else if start >= keep + discard {
                shifted.insert(start - discard, entry);
            }
            // chunks fully inside [keep, keep+discard) are dropped; callers
            // are responsible for never discarding across a chunk boundary.
        }
        self.media = shifted;
    }

    /// Truncate to length `n`. Asserts `tokens[n-1]` is a chunk start if it
    /// is a placeholder — splitting a chunk is a programmer error.
    pub fn keep_first(&mut self, n: usize) {
        if n >= self.tokens.len() {
            return;
        }
        if n > 0 && self.tokens[n - 1] == NULL_TOKEN {
            assert!(
                self.media.contains_key(&(n - 1)),
                "keep_first({n}) would split a media chunk"
            );
        }
        self.tokens.truncate(n);
        self.media.retain(|&start, _| start < n);
    }

    /// Append a tokenized mtmd chunk: real tokens for text, placeholders
    /// for image/audio, recorded at `start_pos = size_before`.
    pub fn parse_mtmd_chunk(&mut self, chunk: &MtmdInputChunk, hash_id: &str) {
        let start = self.tokens.len();
        match chunk.chunk_type() {
            MtmdInputChunkType::Text => {
                if let Some(text_tokens) = chunk.text_tokens() {
                    self.append_all(text_tokens);
                }
            }
            kind => {
                let n_pos = chunk.n_tokens();
                for _ in 0..n_pos {
                    self.tokens.push(NULL_TOKEN);
                }
                let media_kind = if kind == MtmdInputChunkType::Image {
                    MediaKind::Image
                } else {
                    MediaKind::Audio
                };
                self.media.insert(
                    start,
                    MediaChunk { hash_id: hash_id.to_string(), kind: media_kind, n_pos },
                );
            }
        }
    }

    /// Append every chunk produced by a multimodal tokenization call,
    /// recording each chunk's FNV-1a hash id for KV-cache identity. Does
    /// not consume `chunks` — the scheduler still needs it for
    /// [`eval_mtmd_chunks`].
    pub fn append_chunks(&mut self, chunks: &MtmdInputChunks, hash_ids: &[String]) {
        for i in 0..chunks.len() {
            let Some(chunk) = chunks.get(i) else { continue };
            let hash_id = hash_ids.get(i).map(String::as_str).unwrap_or("");
            self.parse_mtmd_chunk(chunk, hash_id);
        }
    }

    /// The chunk whose `start_pos == pos`.
    pub fn find_chunk(&self, pos: usize) -> Result<&MediaChunk> {
        self.media
            .get(&pos)
            .ok_or_else(|| CoreError::Configuration(format!("no media chunk at position {pos}")))
    }
}

/// Evaluate a freshly tokenized mtmd chunk list into the KV cache for
/// `seq_id`, starting at `n_past`. The safe binding only exposes whole-list
/// evaluation (no per-chunk decode), so multimodal prompts are front-loaded
/// in one call rather than interleaved token-by-token with text the way the
/// incremental prefill loop handles a text-only prompt.
pub fn eval_mtmd_chunks(
    chunks: &MtmdInputChunks,
    mm_ctx: &MtmdContext,
    runtime_ctx: &mut LlamaContext,
    n_past: i32,
    seq_id: i32,
    n_batch: i32,
) -> Result<i32> {
    chunks
        .eval_chunks(mm_ctx, runtime_ctx, n_past, seq_id, n_batch, true)
        .map_err(|e| CoreError::Configuration(format!("mtmd chunk eval failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(v: i32) -> LlamaToken {
        LlamaToken::new(v)
    }

    #[test]
    fn append_and_len() {
        let mut buf = TokenBuffer::new();
        buf.append(tok(1));
        buf.append_all(&[tok(2), tok(3)]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_slice(), &[tok(1), tok(2), tok(3)]);
    }

    #[test]
    fn shift_compacts_tail() {
        let mut buf = TokenBuffer::from_tokens(vec![tok(0), tok(1), tok(2), tok(3), tok(4)]);
        buf.shift(1, 2);
        assert_eq!(buf.as_slice(), &[tok(0), tok(3), tok(4)]);
    }

    #[test]
    fn shift_noop_when_discard_zero() {
        let mut buf = TokenBuffer::from_tokens(vec![tok(0), tok(1)]);
        buf.shift(0, 0);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn keep_first_truncates() {
        let mut buf = TokenBuffer::from_tokens(vec![tok(0), tok(1), tok(2), tok(3)]);
        buf.keep_first(2);
        assert_eq!(buf.as_slice(), &[tok(0), tok(1)]);
    }

    #[test]
    #[should_panic(expected = "would split")]
    fn keep_first_rejects_mid_chunk_split() {
        let mut buf = TokenBuffer::new();
        buf.append(tok(0));
        buf.tokens.push(NULL_TOKEN);
        buf.tokens.push(NULL_TOKEN);
        // no entry registered at position 1: simulates a non-start placeholder
        buf.keep_first(2);
    }
}
