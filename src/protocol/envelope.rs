//! Gateway ↔ backend envelope.
//!
//! Backend links are trusted and unencrypted. Each envelope reuses the
//! client frame header and adds a fixed prefix identifying the client:
//!
//! ```text
//! [4-byte header][handle u64 BE][serial u32 BE][name][payload]
//! ```
//!
//! The header's length fields describe only name and payload.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::net::handle::Handle;
use crate::protocol::frame::{frame_limit, FrameError, Header, HEADER_LEN};

/// Bytes between the header and the name.
pub const PREFIX_LEN: usize = 12;

/// Reserved envelope names.
pub mod names {
    /// Gateway → backend registration request.
    pub const REGISTER: &str = "gateway.register";
    /// Backend → gateway registration response.
    pub const REGISTER_ACK: &str = "gateway.register.ack";
    /// Backend → gateway: mark the client authorized.
    pub const AUTHORIZE: &str = "gateway.authorize";
    /// Backend → gateway: close the client.
    pub const KICK: &str = "gateway.kick";
    /// Gateway → backend: a client went away.
    pub const OFFLINE: &str = "gateway.offline";
    pub const PING: &str = "gateway.ping";
    pub const PONG: &str = "gateway.pong";
}

/// A message addressed to or from a specific client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub handle: Handle,
    /// Correlation serial; 0 marks an unsolicited push.
    pub serial: u32,
    pub name: String,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(
        handle: Handle,
        serial: u32,
        name: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            handle,
            serial,
            name: name.into(),
            payload: payload.into(),
        }
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<BytesMut, FrameError> {
    let header = Header::new(envelope.name.len(), envelope.payload.len())?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + PREFIX_LEN + header.body_len());
    out.put_u32(header.pack());
    out.put_u64(envelope.handle.as_u64());
    out.put_u32(envelope.serial);
    out.put_slice(envelope.name.as_bytes());
    out.put_slice(&envelope.payload);
    Ok(out)
}

/// Decode one envelope from the front of `buf`; same contract as
/// [`decode_frame`](crate::protocol::frame::decode_frame).
pub fn decode_envelope(buf: &mut BytesMut, capacity: usize) -> Result<Option<Envelope>, FrameError> {
    let Some(header) = Header::peek(buf) else {
        return Ok(None);
    };

    let total = HEADER_LEN + PREFIX_LEN + header.body_len();
    let limit = frame_limit(capacity);
    if total > limit {
        return Err(FrameError::Oversized { size: total, limit });
    }
    if total > buf.len() {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let handle = Handle::from_u64(buf.get_u64());
    let serial = buf.get_u32();
    let name = buf.split_to(header.name_len);
    let payload = buf.split_to(header.payload_len).freeze();

    Ok(Some(Envelope {
        handle,
        serial,
        name: String::from_utf8_lossy(&name).into_owned(),
        payload,
    }))
}

/// The backend refused registration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("registration rejected with code {code}")]
pub struct RegisterRejected {
    pub code: u8,
}

/// Exchange performed on a fresh backend link before it may carry traffic.
pub trait RegisterProtocol: Send + Sync + fmt::Debug {
    /// Request written right after the transport connects.
    fn request(&self, gateway_id: u32, target_id: u32) -> Envelope;

    /// Whether `envelope` is the registration response.
    fn is_response(&self, envelope: &Envelope) -> bool;

    /// Validate a registration response.
    fn accept(&self, envelope: &Envelope) -> Result<(), RegisterRejected>;
}

/// `gateway.register` / `gateway.register.ack` exchange.
///
/// Request payload: gateway id (u32 BE) then target id (u32 BE).
/// Response payload: first byte 0 on success, any other value is a reject code.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRegister;

impl RegisterProtocol for DefaultRegister {
    fn request(&self, gateway_id: u32, target_id: u32) -> Envelope {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u32(gateway_id);
        payload.put_u32(target_id);
        Envelope::new(Handle::from_u64(0), 0, names::REGISTER, payload.freeze())
    }

    fn is_response(&self, envelope: &Envelope) -> bool {
        envelope.name == names::REGISTER_ACK
    }

    fn accept(&self, envelope: &Envelope) -> Result<(), RegisterRejected> {
        match envelope.payload.first() {
            Some(0) => Ok(()),
            Some(&code) => Err(RegisterRejected { code }),
            None => Err(RegisterRejected { code: u8::MAX }),
        }
    }
}
