//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Client frame
//!     → forward.rs (name → route, auth flag)
//!     → router.rs (auth gate, Loader.pick, record correlation)
//!     → BackendConnection queue
//!
//! Backend envelope
//!     → router.rs (control names, or Route::Client)
//!     → correlation.rs (wake waiter by (handle, serial))
//!     → ConnectionRegistry.grab(handle) → client outbound queue
//! ```
//!
//! # Design Decisions
//! - Forward table built at startup, immutable at runtime
//! - Explicit registration table instead of type-keyed dispatch
//! - Correlation is best-effort: late replies find no entry and are
//!   still delivered, just not awaited

pub mod correlation;
pub mod forward;
pub mod router;

pub use correlation::{PendingCorrelation, ReplyOutcome};
pub use forward::{ForwardEntry, ForwardTable, Route};
pub use router::{Disposition, RequestRouter, RouteError, RouterSettings};
