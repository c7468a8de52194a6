//! Incremental UTF-8 decoding of response body chunks.
//!
//! HTTP bodies arrive in arbitrary byte boundaries, so a multi-byte character
//! may be split across two reads. The decoder holds back an incomplete
//! trailing sequence and prepends it to the next chunk before decoding.
use crate::error::StreamError;

/// Streaming UTF-8 decoder for one response body.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
    replaced: usize,
}

impl Utf8StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk, returning all text that is complete so far.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        let mut out = String::with_capacity(bytes.len() + self.pending.len());
        self.feed_into(bytes, &mut out);
        out
    }

    /// Decode the next chunk and append complete text to `out`.
    ///
    /// Invalid sequences in the middle of the input are replaced with
    /// U+FFFD; only an incomplete sequence at the very end is held back.
    pub fn feed_into(&mut self, bytes: &[u8], out: &mut String) {
        if self.pending.is_empty() {
            let consumed = decode_prefix(bytes, out, &mut self.replaced);
            self.pending.extend_from_slice(&bytes[consumed..]);
        } else {
            self.pending.extend_from_slice(bytes);
            let consumed = decode_prefix(&self.pending, out, &mut self.replaced);
            if consumed == self.pending.len() {
                self.pending.clear();
            } else if consumed > 0 {
                let remain_len = self.pending.len() - consumed;
                self.pending.copy_within(consumed.., 0);
                self.pending.truncate(remain_len);
            }
        }
    }

    /// Flush the decoder at end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Encoding`] when an incomplete multi-byte
    /// sequence is still pending. The bytes are dropped either way.
    pub fn finish(&mut self) -> Result<(), StreamError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let dropped_bytes = self.pending.len();
        self.pending.clear();
        Err(StreamError::Encoding { dropped_bytes })
    }

    /// Number of bytes currently held back waiting for continuation bytes.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of invalid sequences replaced with U+FFFD so far.
    #[must_use]
    pub fn replaced_count(&self) -> usize {
        self.replaced
    }
}

/// Decode as much of `input` as possible into `out`.
///
/// Returns the number of bytes consumed; anything past that is an incomplete
/// trailing sequence.
fn decode_prefix(mut input: &[u8], out: &mut String, replaced: &mut usize) -> usize {
    let total = input.len();
    loop {
        match std::str::from_utf8(input) {
            Ok(text) => {
                out.push_str(text);
                return total;
            }
            Err(e) => {
                let (valid, rest) = input.split_at(e.valid_up_to());
                // Safety: valid_up_to is guaranteed to be a valid UTF-8 boundary.
                out.push_str(unsafe { std::str::from_utf8_unchecked(valid) });
                match e.error_len() {
                    Some(invalid_len) => {
                        tracing::warn!(
                            invalid_len,
                            "invalid UTF-8 sequence in stream body, substituting U+FFFD"
                        );
                        out.push(char::REPLACEMENT_CHARACTER);
                        *replaced += 1;
                        input = &rest[invalid_len..];
                    }
                    None => return total - rest.len(),
                }
            }
        }
    }
}
