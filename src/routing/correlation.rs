//! Pending request/reply correlation.
//!
//! Entries are keyed by `(client handle, serial)` and removed by exactly one
//! of: the reply arriving, an explicit cancel, or the client going away.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::net::handle::Handle;
use crate::observability::metrics;

/// What a waiting caller learns about its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The backend replied.
    Delivered,
    /// No healthy backend could take the request.
    NoBackend,
    /// The request or its reply was lost.
    Dropped,
    /// The caller stopped waiting.
    TimedOut,
}

#[derive(Debug, Default)]
pub struct PendingCorrelation {
    waiters: Mutex<HashMap<(Handle, u32), oneshot::Sender<ReplyOutcome>>>,
}

impl PendingCorrelation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a waiter. A previous waiter under the same key is dropped.
    pub fn insert(&self, handle: Handle, serial: u32) -> oneshot::Receiver<ReplyOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        waiters.insert((handle, serial), tx);
        metrics::record_pending_correlations(waiters.len());
        rx
    }

    /// Remove the entry and tell its waiter `outcome`.
    pub fn wake(&self, handle: Handle, serial: u32, outcome: ReplyOutcome) -> bool {
        let Some(tx) = self.remove(handle, serial) else {
            return false;
        };
        // The waiter may have given up already.
        let _ = tx.send(outcome);
        true
    }

    /// Remove the entry without notifying.
    pub fn cancel(&self, handle: Handle, serial: u32) -> bool {
        self.remove(handle, serial).is_some()
    }

    /// Remove every entry belonging to `handle`.
    pub fn cancel_handle(&self, handle: Handle) -> usize {
        let mut waiters = self.waiters.lock();
        let before = waiters.len();
        waiters.retain(|(h, _), _| *h != handle);
        metrics::record_pending_correlations(waiters.len());
        before - waiters.len()
    }

    fn remove(&self, handle: Handle, serial: u32) -> Option<oneshot::Sender<ReplyOutcome>> {
        let mut waiters = self.waiters.lock();
        let tx = waiters.remove(&(handle, serial));
        metrics::record_pending_correlations(waiters.len());
        tx
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.waiters.lock().clear();
        metrics::record_pending_correlations(0);
    }
}
