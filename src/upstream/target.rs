//! Backend target descriptors and connection state.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::TargetConfig;
use crate::upstream::UpstreamError;

/// Largest number of targets one gateway may manage.
pub const MAX_TARGETS: usize = 2048;

/// Connect timeout used when a target has no budget configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend connection state machine.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    UnConnected = 0,
    Connecting = 1,
    Verify = 2,
    Connected = 3,
}

impl From<u8> for ConnState {
    fn from(val: u8) -> Self {
        match val {
            1 => ConnState::Connecting,
            2 => ConnState::Verify,
            3 => ConnState::Connected,
            _ => ConnState::UnConnected,
        }
    }
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::UnConnected => "unconnected",
            ConnState::Connecting => "connecting",
            ConnState::Verify => "verify",
            ConnState::Connected => "connected",
        }
    }
}

/// One backend instance: static descriptor plus live state.
#[derive(Debug)]
pub struct BackendTarget {
    pub id: u32,
    /// Service class.
    pub name: String,
    pub address: String,
    /// Budget for Connecting + Verify; zero disables the check.
    pub timeout: Duration,
    pub out_queue: usize,

    virtual_id: u32,
    state: AtomicU8,
    /// Local port of the current link, 0 when none.
    socket: AtomicU64,
    since: Mutex<Instant>,
}

impl BackendTarget {
    pub fn new(config: &TargetConfig, virtual_id: u32) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            address: config.address.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            out_queue: config.out_queue,
            virtual_id,
            state: AtomicU8::new(ConnState::UnConnected as u8),
            socket: AtomicU64::new(0),
            since: Mutex::new(Instant::now()),
        }
    }

    /// Key in the owning ring.
    pub fn virtual_id(&self) -> u32 {
        self.virtual_id
    }

    /// `name#id`, used in logs and metric labels.
    pub fn label(&self) -> String {
        format!("{}#{}", self.name, self.id)
    }

    pub fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    /// Move `from → to` only if the current state is `from`.
    pub fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force a state; returns the previous one.
    pub fn set_state(&self, to: ConnState) -> ConnState {
        ConnState::from(self.state.swap(to as u8, Ordering::AcqRel))
    }

    pub fn socket(&self) -> u64 {
        self.socket.load(Ordering::Relaxed)
    }

    pub fn set_socket(&self, socket: u64) {
        self.socket.store(socket, Ordering::Relaxed);
    }

    /// Restart the Connecting/Verify timer (and the connected-since stamp).
    pub fn reset_timer(&self) {
        *self.since.lock() = Instant::now();
    }

    pub fn since(&self) -> Instant {
        *self.since.lock()
    }

    /// Time over budget, if the timer has run out.
    pub fn is_timed_out(&self, now: Instant) -> Option<Duration> {
        if self.timeout.is_zero() {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.since());
        (elapsed > self.timeout).then_some(elapsed)
    }

    pub fn connect_timeout(&self) -> Duration {
        if self.timeout.is_zero() {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            self.timeout
        }
    }
}

/// Build targets from configuration, assigning virtual ids from 1.
pub fn build_targets(configs: &[TargetConfig]) -> Result<Vec<Arc<BackendTarget>>, UpstreamError> {
    if configs.len() > MAX_TARGETS {
        return Err(UpstreamError::TooManyTargets(configs.len()));
    }
    Ok(configs
        .iter()
        .zip(1u32..)
        .map(|(config, vid)| Arc::new(BackendTarget::new(config, vid)))
        .collect())
}
