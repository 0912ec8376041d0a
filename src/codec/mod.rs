//! # Output Codec
//!
//! PTY output arrives as arbitrary byte chunks. A UTF-8 character can be cut
//! in half by any read, so decoding each chunk on its own would turn both
//! halves into replacement characters. [`Utf8Decoder`] holds back an
//! incomplete trailing sequence and prepends it to the next chunk.
//!
//! The module also carries the base64 helpers used by the PTY host protocol.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::Result;

/// Incremental UTF-8 decoder for a single output stream.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next chunk of the stream.
    ///
    /// An incomplete sequence at the end of `bytes` is buffered instead of
    /// being emitted. Bytes that can never form a valid character are
    /// replaced with U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let complete = buf.len() - incomplete_tail_len(&buf);
        self.pending = buf.split_off(complete);

        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ends the stream, emitting whatever is still buffered.
    ///
    /// Consumes the decoder so it can only happen once per stream.
    pub fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`, or 0.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        return if width > back { back } else { 0 };
    }
    0
}

/// Encodes viewer keystrokes for a host `input` command.
pub fn encode_input(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Encodes raw PTY bytes for a host `output` message.
pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decodes the base64 payload of a host message.
pub fn decode_payload(data: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(data)?)
}
