//! Supervisory loops.
//!
//! # Data Flow
//! ```text
//! Auth guard (auth.rs):
//!     Periodic timer
//!     → Scan live clients not yet authorized
//!     → Subtract elapsed time from their budget
//!     → Close those at zero
//!
//! Reconnect guard (reconnect.rs):
//!     Periodic timer
//!     → Connecting/Verify over budget → close (back to UnConnected)
//!     → UnConnected → Connecting → spawn connect attempt
//! ```
//!
//! # Design Decisions
//! - Both loops stop on the shutdown broadcast and finish their own work
//!   before returning, so `Shutdown::drain` can join them
//! - Scans take leases, never hold the registry lock while closing

pub mod auth;
pub mod reconnect;

pub use auth::AuthGuard;
pub use reconnect::ReconnectGuard;
