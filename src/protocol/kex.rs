//! 64-bit Diffie-Hellman key agreement.
//!
//! Both sides generate an ephemeral pair over the group `(P, G)`, swap the
//! 8-byte public values, and arrive at the same 64-bit secret.

use rand::Rng;
use thiserror::Error;

/// Group modulus (largest 64-bit prime).
pub const DH64_P: u64 = 0xFFFF_FFFF_FFFF_FFC5;
/// Group generator.
pub const DH64_G: u64 = 5;
/// Length of a serialized public value.
pub const PUBLIC_KEY_LEN: usize = 8;

/// Errors raised while agreeing on a secret.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peer sent 0, 1 or a value outside the group.
    #[error("peer public value {0:#018x} is outside the group")]
    InvalidPublicKey(u64),
    /// Peer did not send its public value in time.
    #[error("handshake timed out")]
    Timeout,
    /// Connection closed or failed mid-handshake.
    #[error("handshake io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An ephemeral private/public pair.
#[derive(Clone)]
pub struct KeyPair {
    private: u64,
    public: u64,
}

impl KeyPair {
    /// Generate a fresh pair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let private = rng.gen_range(2..DH64_P - 1);
        Self::from_private(private)
    }

    /// Derive the pair for a known private scalar.
    pub fn from_private(private: u64) -> Self {
        Self {
            private,
            public: pow_mod(DH64_G, private, DH64_P),
        }
    }

    pub fn public(&self) -> u64 {
        self.public
    }

    /// Public value as sent on the wire.
    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_be_bytes()
    }

    /// Combine our private scalar with the peer's public value.
    pub fn agree(&self, peer_public: u64) -> Result<SharedSecret, HandshakeError> {
        if peer_public < 2 || peer_public >= DH64_P {
            return Err(HandshakeError::InvalidPublicKey(peer_public));
        }
        Ok(SharedSecret(pow_mod(peer_public, self.private, DH64_P)))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &format_args!("{:#018x}", self.public))
            .finish_non_exhaustive()
    }
}

/// Agreed secret; seeds the stream cipher.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SharedSecret(u64);

impl SharedSecret {
    pub fn from_value(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Big-endian serialization used as cipher key.
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

fn pow_mod(base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result = 1u64;
    let mut base = base % m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}
