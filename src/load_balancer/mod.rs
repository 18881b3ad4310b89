//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Forward entry → service class
//!     → loader.rs (LoaderSet → Loader for the service)
//!     → Sample random key → ring.rs (first point at or after hash)
//!     → virtual id → BackendConnection, if Connected
//!     → Retry with a fresh key up to `pick_attempts` times
//! ```
//!
//! # Design Decisions
//! - One ring per service class; targets keyed by virtual id
//! - Only connected targets are on the ring
//! - Selection never blocks: bounded attempts, then "no healthy backend"

pub mod loader;
pub mod ring;

pub use loader::{Loader, LoaderSet};

/// A target that can sit on a ring.
pub trait RingMember: Send + Sync {
    /// Whether the member can take traffic right now.
    fn is_available(&self) -> bool;
}
