//! Backend (upstream) subsystem.
//!
//! # Data Flow
//! ```text
//! Reconnect guard:
//!     UnConnected → begin_connect → Connecting
//!     → connect.rs (TCP connect, send registration) → Verify
//!     → registration response → Connected → join Loader
//!
//! Router → forward() → bounded queue → sender actor
//!     → wait ≤ attempts × interval for Connected → write envelope
//!
//! Backend socket → reader → decode envelope → router (clientward)
//! ```
//!
//! # Design Decisions
//! - One persistent connection per target, shared by all clients
//! - Any close returns the target to UnConnected and removes it from its
//!   loader; the guard alone reconnects

pub mod connection;
pub mod target;

use thiserror::Error;

use crate::protocol::envelope::RegisterRejected;
use crate::protocol::frame::FrameError;

pub use connection::{BackendConnection, LinkSettings};
pub use target::{BackendTarget, ConnState};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    #[error("connect timed out")]
    Timeout,
    #[error("backend io error: {0}")]
    Io(std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Rejected(#[from] RegisterRejected),
    #[error("backend not connected after {attempts} checks")]
    Unreachable { attempts: usize },
    #[error("backend write stalled for {0:?}")]
    WriteStalled(std::time::Duration),
    #[error("backend link has no writer")]
    NotConnected,
    #[error("backend outbound queue is full")]
    QueueFull,
    #[error("backend sender has stopped")]
    Closed,
    #[error("link was closed during connect")]
    Superseded,
    #[error("{0} targets configured, limit is {max}", max = target::MAX_TARGETS)]
    TooManyTargets(usize),
}

impl UpstreamError {
    /// Label for the dropped-message counter.
    pub fn drop_reason(&self) -> &'static str {
        match self {
            UpstreamError::Unreachable { .. } | UpstreamError::NotConnected => "backend_unreachable",
            UpstreamError::Frame(_) => "encode_failed",
            UpstreamError::QueueFull => "backend_queue_full",
            UpstreamError::Closed => "backend_stopped",
            UpstreamError::WriteStalled(_) => "backend_write_stalled",
            _ => "backend_write_failed",
        }
    }
}
