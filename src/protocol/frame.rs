//! Length-prefixed frame codec.
//!
//! # Wire Format
//! ```text
//! | 24 bit         | 8 bit       |
//! |----------------|-------------|
//! | payload length | name length |   4-byte big-endian header
//!
//! [header][name bytes][payload bytes]
//! ```
//!
//! # Design Decisions
//! - Incomplete input is `Ok(None)`, never an error
//! - Frames larger than twice the nominal buffer capacity are fatal
//! - When a cipher is installed every byte after the handshake preamble
//!   (header and body) passes through the keystream exactly once, in order

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::cipher::StreamCipher;

/// Size of the packed frame header.
pub const HEADER_LEN: usize = 4;
/// Largest name the 8-bit length field can describe.
pub const MAX_NAME_LEN: usize = 0xFF;
/// Largest payload the 24-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

const PAYLOAD_LEN_MASK: u32 = 0xFF_FFFF;
const PAYLOAD_LEN_SHIFT: u32 = 8;
const NAME_LEN_MASK: u32 = 0xFF;

/// Errors produced while framing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The announced frame cannot fit the connection's buffer budget.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    Oversized { size: usize, limit: usize },
    /// Name does not fit the 8-bit length field.
    #[error("message name is {0} bytes, limit is {MAX_NAME_LEN}")]
    NameTooLong(usize),
    /// Payload does not fit the 24-bit length field.
    #[error("payload is {0} bytes, limit is {MAX_PAYLOAD_LEN}")]
    PayloadTooLong(usize),
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub payload_len: usize,
    pub name_len: usize,
}

impl Header {
    /// Validate lengths against their field widths.
    pub fn new(name_len: usize, payload_len: usize) -> Result<Self, FrameError> {
        if name_len > MAX_NAME_LEN {
            return Err(FrameError::NameTooLong(name_len));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLong(payload_len));
        }
        Ok(Self {
            payload_len,
            name_len,
        })
    }

    /// Pack into the 32-bit header word.
    pub fn pack(&self) -> u32 {
        ((self.payload_len as u32 & PAYLOAD_LEN_MASK) << PAYLOAD_LEN_SHIFT)
            | (self.name_len as u32 & NAME_LEN_MASK)
    }

    /// Unpack a 32-bit header word.
    pub fn unpack(word: u32) -> Self {
        Self {
            payload_len: ((word >> PAYLOAD_LEN_SHIFT) & PAYLOAD_LEN_MASK) as usize,
            name_len: (word & NAME_LEN_MASK) as usize,
        }
    }

    /// Bytes following the header.
    pub fn body_len(&self) -> usize {
        self.name_len + self.payload_len
    }

    /// Peek the header at the front of `buf` without consuming it.
    pub(crate) fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self::unpack((&buf[..HEADER_LEN]).get_u32()))
    }
}

/// A named application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Upper bound for a single frame given a nominal buffer capacity.
pub fn frame_limit(capacity: usize) -> usize {
    capacity.saturating_mul(2)
}

/// Build a plaintext frame.
pub fn encode_frame(name: &str, payload: &[u8]) -> Result<BytesMut, FrameError> {
    let header = Header::new(name.len(), payload.len())?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + header.body_len());
    out.put_u32(header.pack());
    out.put_slice(name.as_bytes());
    out.put_slice(payload);
    Ok(out)
}

/// Decode one plaintext frame from the front of `buf`.
///
/// Consumes exactly header + name + payload bytes on success and nothing
/// otherwise.
pub fn decode_frame(buf: &mut BytesMut, capacity: usize) -> Result<Option<Frame>, FrameError> {
    let Some(header) = Header::peek(buf) else {
        return Ok(None);
    };

    let total = HEADER_LEN + header.body_len();
    let limit = frame_limit(capacity);
    if total > limit {
        return Err(FrameError::Oversized { size: total, limit });
    }
    if total > buf.len() {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let name = buf.split_to(header.name_len);
    let payload = buf.split_to(header.payload_len).freeze();

    Ok(Some(Frame {
        name: String::from_utf8_lossy(&name).into_owned(),
        payload,
    }))
}

/// Stateful decoder for one direction of a client connection.
#[derive(Debug)]
pub struct FrameDecoder {
    cipher: Option<StreamCipher>,
    /// Buffered bytes (from the front) that already went through the keystream.
    decrypted: usize,
    capacity: usize,
}

impl FrameDecoder {
    /// Create a plaintext decoder.
    pub fn new(capacity: usize) -> Self {
        Self {
            cipher: None,
            decrypted: 0,
            capacity,
        }
    }

    /// Install the keystream. Bytes already buffered are treated as ciphertext.
    pub fn set_cipher(&mut self, cipher: StreamCipher) {
        self.cipher = Some(cipher);
        self.decrypted = 0;
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Decode the next frame, decrypting newly buffered bytes first.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if let Some(cipher) = self.cipher.as_mut() {
            if buf.len() > self.decrypted {
                cipher.apply(&mut buf[self.decrypted..]);
                self.decrypted = buf.len();
            }
        }

        let before = buf.len();
        let decoded = decode_frame(buf, self.capacity)?;
        self.decrypted = self.decrypted.saturating_sub(before - buf.len());
        Ok(decoded)
    }

    /// Drop cipher state so the decoder can be pooled.
    pub fn reset(&mut self) {
        self.cipher = None;
        self.decrypted = 0;
    }
}

/// Stateful encoder for one direction of a client connection.
#[derive(Debug, Default)]
pub struct FrameEncoder {
    cipher: Option<StreamCipher>,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cipher(&mut self, cipher: StreamCipher) {
        self.cipher = Some(cipher);
    }

    /// Encode and, when a cipher is installed, encrypt the whole frame.
    pub fn encode(&mut self, name: &str, payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut out = encode_frame(name, payload)?;
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut out);
        }
        Ok(out.freeze())
    }

    pub fn reset(&mut self) {
        self.cipher = None;
    }
}
