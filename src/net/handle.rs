//! Connection identities.
//!
//! A [`Handle`] is a Snowflake id: 41 bits of milliseconds since a custom
//! epoch, 10 bits of gateway worker id and 12 bits of per-millisecond
//! sequence. [`SocketId`] is a process-local transport id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// 2020-01-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: u64 = 1_577_836_800_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
/// Highest usable worker (gateway) id.
pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u16 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = WORKER_BITS + SEQUENCE_BITS;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("worker id {0} exceeds {MAX_WORKER_ID}")]
    WorkerOutOfRange(u16),
}

/// Globally unique client connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn worker_id(&self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & MAX_WORKER_ID as u64) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & SEQUENCE_MASK as u64) as u16
    }

    /// Allocation time in unix milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        (self.0 >> TIMESTAMP_SHIFT) + EPOCH_MS
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Snowflake id generator owned by one registry.
#[derive(Debug)]
pub struct Snowflake {
    worker: u16,
    last_ms: u64,
    sequence: u16,
}

impl Snowflake {
    pub fn new(worker: u16) -> Result<Self, HandleError> {
        if worker > MAX_WORKER_ID {
            return Err(HandleError::WorkerOutOfRange(worker));
        }
        Ok(Self {
            worker,
            last_ms: 0,
            sequence: 0,
        })
    }

    /// Allocate the next handle.
    ///
    /// Never blocks: an exhausted sequence or a clock that stepped back
    /// borrows the next logical millisecond, so handles stay strictly
    /// increasing.
    pub fn next_id(&mut self) -> Handle {
        self.next_at(now_ms())
    }

    fn next_at(&mut self, now: u64) -> Handle {
        if now > self.last_ms {
            self.last_ms = now;
            self.sequence = 0;
        } else {
            self.sequence = (self.sequence + 1) & SEQUENCE_MASK;
            if self.sequence == 0 {
                self.last_ms += 1;
            }
        }

        let elapsed = self.last_ms.saturating_sub(EPOCH_MS);
        Handle(
            (elapsed << TIMESTAMP_SHIFT)
                | ((self.worker as u64) << SEQUENCE_BITS)
                | self.sequence as u64,
        )
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Global counter for transport socket ids.
static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Transport-level identifier of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    pub fn new() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn socket_ids_unique() {
        assert_ne!(SocketId::new(), SocketId::new());
    }

    #[test]
    fn handles_unique_and_carry_worker() {
        let mut gen = Snowflake::new(37).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let handle = gen.next_id();
            assert_eq!(handle.worker_id(), 37);
            assert!(seen.insert(handle));
        }
    }

    #[test]
    fn handles_are_time_ordered() {
        let mut gen = Snowflake::new(1).unwrap();
        let a = gen.next_id();
        let b = gen.next_id();
        assert!(b > a);
        assert!(a.timestamp_ms() >= EPOCH_MS);
    }

    #[test]
    fn exhausted_sequence_moves_to_next_millisecond() {
        let mut gen = Snowflake::new(2).unwrap();
        let now = EPOCH_MS + 1_000;
        let mut last = gen.next_at(now);
        for _ in 0..SEQUENCE_MASK {
            let next = gen.next_at(now);
            assert!(next > last);
            last = next;
        }
        assert_eq!(last.timestamp_ms(), now);
        assert_eq!(last.sequence(), SEQUENCE_MASK);

        let rolled = gen.next_at(now);
        assert!(rolled > last);
        assert_eq!(rolled.timestamp_ms(), now + 1);
        assert_eq!(rolled.sequence(), 0);
    }

    #[test]
    fn clock_step_back_keeps_handles_increasing() {
        let mut gen = Snowflake::new(2).unwrap();
        let now = EPOCH_MS + 5_000;
        let before = gen.next_at(now);
        let after = gen.next_at(now - 2_000);
        assert!(after > before);
        assert_eq!(after.timestamp_ms(), now);

        // Real time catching up resets the sequence.
        let later = gen.next_at(now + 1);
        assert!(later > after);
        assert_eq!(later.sequence(), 0);
    }

    #[test]
    fn worker_id_bounded() {
        assert_eq!(
            Snowflake::new(MAX_WORKER_ID + 1).unwrap_err(),
            HandleError::WorkerOutOfRange(MAX_WORKER_ID + 1)
        );
    }
}
