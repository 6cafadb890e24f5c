//! Incremental UTF-8 reassembly for token-by-token detokenization.
//!
//! A single token's bytes are not guaranteed to be a complete UTF-8
//! sequence — multi-byte codepoints can straddle a token boundary. This
//! generalizes the accumulate-then-emit-maximal-valid-prefix loop from the
//! teacher's `infer_into_stream`, which accumulated into a `Vec<u8>` before
//! trying `std::str::from_utf8` and only forwarding the valid prefix.

#[derive(Debug, Default)]
pub struct Utf8Streamer {
    pending: Vec<u8>,
}

impl Utf8Streamer {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Feed a token's raw bytes in, returning the maximal valid UTF-8
    /// prefix now available (empty if nothing is ready yet).
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(piece) => {
                    out.push_str(piece);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let n = err.valid_up_to();
                    if n == 0 {
                        break;
                    }
                    out.push_str(std::str::from_utf8(&self.pending[..n]).unwrap());
                    self.pending.drain(..n);
                }
            }
        }
        out
    }

    /// Bytes retained in the tail that never became a complete codepoint.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_codepoints_emit_immediately() {
        let mut streamer = Utf8Streamer::new();
        assert_eq!(streamer.push("hello ".as_bytes()), "hello ");
        assert_eq!(streamer.push("world".as_bytes()), "world");
    }

    #[test]
    fn split_multibyte_codepoint_is_held_back() {
        let bytes = "é".as_bytes(); // 2-byte UTF-8 sequence
        let mut streamer = Utf8Streamer::new();
        assert_eq!(streamer.push(&bytes[..1]), "");
        assert_eq!(streamer.push(&bytes[1..]), "é");
        assert!(streamer.pending().is_empty());
    }

    #[test]
    fn emits_valid_prefix_while_holding_incomplete_tail() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice("ok ".as_bytes());
        bytes.extend_from_slice(&"é".as_bytes()[..1]);
        let mut streamer = Utf8Streamer::new();
        assert_eq!(streamer.push(&bytes), "ok ");
        assert_eq!(streamer.pending().len(), 1);
    }
}
