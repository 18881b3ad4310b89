//! Per-connection stream cipher.

use std::fmt;

use rc4::consts::U8;
use rc4::{KeyInit, Rc4, StreamCipher as _};

use crate::protocol::kex::SharedSecret;

/// RC4 keystream seeded by the 8-byte big-endian shared secret.
///
/// The keystream position advances with every byte processed, so each
/// direction of a connection needs its own instance and must see bytes in
/// exactly the order the peer produced them.
pub struct StreamCipher {
    inner: Rc4<U8>,
    processed: u64,
}

impl StreamCipher {
    /// Seed a cipher from an agreed secret.
    pub fn from_secret(secret: &SharedSecret) -> Self {
        let key = secret.to_bytes();
        Self {
            inner: Rc4::new(&key.into()),
            processed: 0,
        }
    }

    /// Encrypt or decrypt `buf` in place.
    pub fn apply(&mut self, buf: &mut [u8]) {
        self.inner.apply_keystream(buf);
        self.processed += buf.len() as u64;
    }

    /// Keystream bytes consumed so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }
}

impl fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCipher")
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}
