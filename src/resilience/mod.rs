//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → retries.rs (wait for Connected, bounded by attempts × interval)
//!     → Still not connected: drop and log
//!     → Reconnection is the reconnect guard's job, never the send path's
//! ```
//!
//! # Design Decisions
//! - Every wait has a hard upper bound
//! - Send paths never trigger reconnects themselves

pub mod retries;

pub use retries::RetryPolicy;
