//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway identity.
    pub gateway: GatewaySection,

    /// Client listener configuration.
    pub listener: ListenerConfig,

    /// Authorization and handshake timing.
    pub auth: AuthConfig,

    /// Ring and correlation settings.
    pub routing: RoutingConfig,

    /// Backend link settings shared by all targets.
    pub upstream: UpstreamConfig,

    /// Backend server definitions.
    pub targets: Vec<TargetConfig>,

    /// Message forwarding table.
    pub messages: Vec<MessageConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Worker id embedded in every client handle (0..=1023).
    pub id: u16,

    pub name: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            id: 1,
            name: "gateway".to_string(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:7000").
    pub bind_address: String,

    /// Maximum registered client connections.
    pub max_connections: usize,

    /// Nominal receive buffer capacity in bytes.
    pub buffer_capacity: usize,

    /// Outbound frame queue length per client.
    pub out_queue: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7000".to_string(),
            max_connections: 10_000,
            buffer_capacity: 64 * 1024,
            out_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Time an unauthorized client may stay connected. Zero disables.
    pub timeout_ms: u64,

    /// Auth guard scan interval.
    pub guard_interval_ms: u64,

    /// Deadline for the peer's public key.
    pub handshake_timeout_ms: u64,

    /// Close (rather than drop the frame) when an unauthorized client
    /// sends an auth-required message.
    pub close_on_unauthorized: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            guard_interval_ms: 1_000,
            handshake_timeout_ms: 5_000,
            close_on_unauthorized: false,
        }
    }
}

impl AuthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn guard_interval(&self) -> Duration {
        Duration::from_millis(self.guard_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Ring points per backend target.
    pub replicas: usize,

    /// Random ring lookups before giving up on a pick.
    pub pick_attempts: usize,

    /// How long a correlated request waits for its reply.
    pub response_timeout_ms: u64,

    /// Service class told about client disconnects.
    pub offline_service: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            replicas: 20,
            pick_attempts: 6,
            response_timeout_ms: 10_000,
            offline_service: None,
        }
    }
}

impl RoutingConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Connected-state polls before a send is abandoned.
    pub auto_err_retry: usize,

    /// Sleep between those polls.
    pub retry_interval_ms: u64,

    /// Reconnect guard scan interval.
    pub check_interval_ms: u64,

    /// Receive buffer capacity for backend links.
    pub buffer_capacity: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            auto_err_retry: 3,
            retry_interval_ms: 100,
            check_interval_ms: 1_000,
            buffer_capacity: 256 * 1024,
        }
    }
}

impl UpstreamConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// A backend server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    /// Target id sent in the register request.
    pub id: u32,

    /// Service class this target belongs to.
    pub name: String,

    /// Address (host:port).
    pub address: String,

    /// Connect / verify timeout.
    #[serde(default = "default_target_timeout")]
    pub timeout_ms: u64,

    /// Outbound envelope queue length.
    #[serde(default = "default_target_queue")]
    pub out_queue: usize,
}

fn default_target_timeout() -> u64 {
    5_000
}

fn default_target_queue() -> usize {
    1_024
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRoute {
    /// Client to backend.
    Forward,
    /// Backend to client.
    Client,
}

/// One forwarding table entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessageConfig {
    pub name: String,

    pub route: MessageRoute,

    /// Service class for `forward` entries.
    #[serde(default)]
    pub service: Option<String>,

    /// Only authorized clients may send it.
    #[serde(default)]
    pub auth: bool,

    /// The sender waits for a correlated reply.
    #[serde(default)]
    pub awaits_reply: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
