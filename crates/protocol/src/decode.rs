//! Tolerant UTF-8 decoding for an unframed byte stream.
//!
//! Shell output arrives in reads of arbitrary size, so a multi-byte
//! character can straddle two reads. The decoder holds back an incomplete
//! trailing sequence until the next read completes it. Bytes that can never
//! form valid UTF-8 are replaced with U+FFFD instead of failing.

use std::str;

/// Longest incomplete UTF-8 prefix that can be carried between reads.
const MAX_CARRY: usize = 3;

/// Incremental, lossy UTF-8 decoder.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    carry: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Creates a decoder with no carried bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next read, returning all text that is complete so far.
    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(input);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;

        loop {
            match str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    if let Ok(text) = str::from_utf8(&rest[..valid]) {
                        out.push_str(text);
                    }
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // Truncated sequence at the end of this read.
                            let tail = &rest[valid..];
                            debug_assert!(tail.len() <= MAX_CARRY);
                            self.carry = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Returns true if an incomplete sequence is being held back.
    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Flushes any held-back bytes as replacement characters.
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            return String::new();
        }
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}
