//! Wire protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Client socket:
//!     handshake.rs (8-byte public values, unframed, unencrypted)
//!     → kex.rs (64-bit Diffie-Hellman → shared secret)
//!     → cipher.rs (RC4 keyed by the secret, one per direction)
//!     → frame.rs ([header][name][payload], fully encrypted)
//!
//! Backend socket:
//!     envelope.rs ([header][handle][serial][name][payload], plaintext)
//! ```
//!
//! # Design Decisions
//! - Codecs are pure functions over `BytesMut`; I/O lives in `net` and `upstream`
//! - Incomplete input is never an error
//! - Keystream order is a hard invariant: every encrypted byte is processed
//!   exactly once, in arrival order

pub mod cipher;
pub mod envelope;
pub mod frame;
pub mod handshake;
pub mod kex;

pub use cipher::StreamCipher;
pub use envelope::{Envelope, RegisterProtocol};
pub use frame::{Frame, FrameDecoder, FrameEncoder, FrameError};
pub use kex::{HandshakeError, KeyPair, SharedSecret};
