//! Client connection state.
//!
//! # Responsibilities
//! - Hold a connection's identity, reference count and authorization state
//! - Own the pooled session (receive buffer plus cipher state)
//! - Expose the outbound queue drained by the connection's writer task
//! - Signal close to every task attached to the connection

use std::net::SocketAddr;
use std::sync::atomic::{AtomicIsize, AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::net::handle::{Handle, SocketId};
use crate::protocol::cipher::StreamCipher;
use crate::protocol::frame::{Frame, FrameDecoder, FrameEncoder, FrameError};
use crate::protocol::handshake::HandshakeState;
use crate::protocol::kex::SharedSecret;

/// Authorization state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No countdown running.
    None,
    /// Waiting for authorization; closed when `remaining` hits zero.
    Pending { remaining: Duration, checked: Instant },
    Authorized,
}

/// A message queued for the client's writer task.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub name: String,
    pub payload: Bytes,
}

impl Outbound {
    pub fn new(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Why a message could not be queued to a client.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum OutboundError {
    #[error("client outbound queue is full")]
    QueueFull,
    #[error("client connection is closed")]
    Closed,
}

/// Receive buffer and cipher state; recycled through the registry pool.
#[derive(Debug)]
pub struct Session {
    recv: BytesMut,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    state: HandshakeState,
}

impl Session {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            recv: BytesMut::with_capacity(buffer_capacity),
            decoder: FrameDecoder::new(buffer_capacity),
            encoder: FrameEncoder::new(),
            state: HandshakeState::AwaitingPeer,
        }
    }

    /// Clear buffered bytes and cipher state for reuse.
    pub fn reset(&mut self) {
        self.recv.clear();
        self.decoder.reset();
        self.encoder.reset();
        self.state = HandshakeState::AwaitingPeer;
    }

    /// Install one keystream per direction.
    pub fn establish(&mut self, secret: &SharedSecret) {
        self.decoder.set_cipher(StreamCipher::from_secret(secret));
        self.encoder.set_cipher(StreamCipher::from_secret(secret));
        self.state = HandshakeState::Established;
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Append received bytes and decode every complete frame.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.recv.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.decode(&mut self.recv)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn encode(&mut self, name: &str, payload: &[u8]) -> Result<Bytes, FrameError> {
        self.encoder.encode(name, payload)
    }

    pub fn buffered(&self) -> usize {
        self.recv.len()
    }
}

/// A live client connection. Owned by the registry; tasks hold leases.
#[derive(Debug)]
pub struct ClientConnection {
    handle: Handle,
    socket: SocketId,
    peer: SocketAddr,
    refs: AtomicIsize,
    auth: Mutex<AuthState>,
    session: Mutex<Option<Session>>,
    outbound: mpsc::Sender<Outbound>,
    closed: watch::Sender<bool>,
    serial: AtomicU32,
}

impl ClientConnection {
    pub(crate) fn new(
        handle: Handle,
        socket: SocketId,
        peer: SocketAddr,
        session: Session,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            handle,
            socket,
            peer,
            refs: AtomicIsize::new(2),
            auth: Mutex::new(AuthState::None),
            session: Mutex::new(Some(session)),
            outbound,
            closed,
            serial: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn ref_count(&self) -> isize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after decrementing.
    pub(crate) fn decrement(&self) -> isize {
        self.refs.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn take_session(&self) -> Option<Session> {
        self.session.lock().take()
    }

    // --- Authorization ---

    /// Start the countdown. A zero timeout disables it.
    pub fn start_auth_countdown(&self, timeout: Duration) {
        let mut auth = self.auth.lock();
        if *auth == AuthState::Authorized || timeout.is_zero() {
            return;
        }
        *auth = AuthState::Pending {
            remaining: timeout,
            checked: Instant::now(),
        };
    }

    /// Subtract the time since the previous check. Returns true when the
    /// budget is exhausted.
    pub fn tick_auth(&self, now: Instant) -> bool {
        let mut auth = self.auth.lock();
        match &mut *auth {
            AuthState::Pending { remaining, checked } => {
                let elapsed = now.saturating_duration_since(*checked);
                *remaining = remaining.saturating_sub(elapsed);
                *checked = now;
                remaining.is_zero()
            }
            _ => false,
        }
    }

    pub fn set_authorized(&self) {
        *self.auth.lock() = AuthState::Authorized;
    }

    pub fn is_authorized(&self) -> bool {
        *self.auth.lock() == AuthState::Authorized
    }

    pub fn auth_state(&self) -> AuthState {
        *self.auth.lock()
    }

    // --- Session ---

    /// Switch both directions to the agreed keystream.
    pub fn install_cipher(&self, secret: &SharedSecret) {
        if let Some(session) = self.session.lock().as_mut() {
            session.establish(secret);
        }
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.session
            .lock()
            .as_ref()
            .map(Session::state)
            .unwrap_or(HandshakeState::AwaitingPeer)
    }

    /// Feed bytes read from the socket; returns the frames completed by them.
    pub fn ingest(&self, bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
        match self.session.lock().as_mut() {
            Some(session) => session.ingest(bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Encode under the session's cipher. `None` once the session was recycled.
    pub fn encode(&self, name: &str, payload: &[u8]) -> Option<Result<Bytes, FrameError>> {
        self.session
            .lock()
            .as_mut()
            .map(|session| session.encode(name, payload))
    }

    // --- Outbound ---

    /// Queue a message for the writer task without waiting.
    pub fn send(&self, message: Outbound) -> Result<(), OutboundError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OutboundError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => OutboundError::Closed,
        })
    }

    /// Next request serial. Wraps and skips 0, which marks pushes.
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }

    // --- Close ---

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(2);
        let conn = ClientConnection::new(
            Handle::from_u64(1),
            SocketId::new(),
            "127.0.0.1:9000".parse().unwrap(),
            Session::new(256),
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn countdown_expires_after_budget() {
        let (conn, _rx) = connection();
        conn.start_auth_countdown(Duration::from_millis(100));
        let AuthState::Pending { checked, .. } = conn.auth_state() else {
            panic!("countdown not started");
        };

        assert!(!conn.tick_auth(checked + Duration::from_millis(60)));
        assert!(!conn.tick_auth(checked + Duration::from_millis(99)));
        assert!(conn.tick_auth(checked + Duration::from_millis(100)));
    }

    #[test]
    fn authorized_connection_never_expires() {
        let (conn, _rx) = connection();
        conn.start_auth_countdown(Duration::from_millis(10));
        conn.set_authorized();
        assert!(!conn.tick_auth(Instant::now() + Duration::from_secs(60)));
        assert!(conn.is_authorized());
    }

    #[test]
    fn serial_skips_zero_on_wrap() {
        let (conn, _rx) = connection();
        conn.serial.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(conn.next_serial(), u32::MAX);
        assert_eq!(conn.next_serial(), 1);
    }

    #[test]
    fn full_queue_reported() {
        let (conn, _rx) = connection();
        conn.send(Outbound::new("a", Bytes::new())).unwrap();
        conn.send(Outbound::new("b", Bytes::new())).unwrap();
        assert_eq!(
            conn.send(Outbound::new("c", Bytes::new())),
            Err(OutboundError::QueueFull)
        );
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let (conn, _rx) = connection();
        let conn = std::sync::Arc::new(conn);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        waiter.await.unwrap();
        assert!(conn.is_closed());
    }
}
