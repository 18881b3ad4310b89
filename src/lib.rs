//! Cluster gateway library.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌────────────────────────────────────────────────────┐
//!                      │                      GATEWAY                       │
//!                      │                                                    │
//!   Client (TCP,       │  ┌─────────┐   ┌──────────┐   ┌───────────────┐   │
//!   RC4 frames)  ──────┼─▶│   net   │──▶│ routing  │──▶│ load_balancer │   │
//!                      │  │ client  │   │  router  │   │  loader+ring  │   │
//!                      │  └────▲────┘   └────▲─────┘   └───────┬───────┘   │
//!                      │       │             │                 ▼           │
//!                      │       │       ┌─────┴──────┐   ┌───────────────┐   │   Backend
//!                      │       └───────│ clientward │◀──│   upstream    │◀──┼──▶ servers
//!                      │               │ dispatcher │   │  connection   │   │
//!                      │               └────────────┘   └───────────────┘   │
//!                      │                                                    │
//!                      │  guard (auth countdown, reconnect)   lifecycle     │
//!                      │  config   observability   resilience   protocol    │
//!                      └────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod guard;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod resilience;
pub mod routing;
pub mod upstream;

pub use config::GatewayConfig;
pub use gateway::{Gateway, GatewayError, RunningGateway};
pub use lifecycle::Shutdown;
