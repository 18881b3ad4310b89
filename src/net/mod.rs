//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop)
//!     → client.rs (per-connection task)
//!         → registry.rs (capacity check, handle allocation, indices)
//!         → key exchange, then connection.rs (session cipher, frame decode)
//!         → hand frames to the router
//!
//! Connection States:
//!     Registered → Handshaking → Established (auth countdown) → Authorized
//!     any state → Closed → erased → recycled when the last lease drops
//! ```
//!
//! # Design Decisions
//! - Capacity is enforced by the registry, not by the listener
//! - Each connection tracked for graceful shutdown
//! - Handles are snowflake ids; socket ids are process-local counters

pub mod client;
pub mod connection;
pub mod handle;
pub mod listener;
pub mod registry;

pub use client::{serve_client, ClientSettings};
pub use connection::{AuthState, ClientConnection, Outbound, OutboundError};
pub use handle::{Handle, SocketId};
pub use listener::Listener;
pub use registry::{ConnectionLease, ConnectionRegistry, RegistryError};
