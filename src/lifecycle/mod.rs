//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (gateway.rs):
//!     Validated config → registry, loaders, backends → bind listener
//!     → spawn accept loop, guards, dispatcher, backend senders
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Stop guards
//!     → Close backends → Close clients → Drain tasks → Exit
//! ```
//!
//! # Design Decisions
//! - Every background task is spawned through `Shutdown` and joined on drain
//! - Shutdown has timeout: stragglers are aborted after the deadline

pub mod shutdown;

pub use shutdown::Shutdown;
