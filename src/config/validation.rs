//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (forward entries reference a target class)
//! - Validate value ranges (sizes and intervals > 0, worker id in range)
//! - Detect duplicate target ids and message names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;

use crate::config::schema::{GatewayConfig, MessageRoute};
use crate::net::handle::MAX_WORKER_ID;
use crate::protocol::frame::MAX_NAME_LEN;
use crate::upstream::target::MAX_TARGETS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.gateway.id > MAX_WORKER_ID {
        errors.push(ValidationError::new(
            "gateway.id",
            format!("must be at most {MAX_WORKER_ID}"),
        ));
    }

    let positive = [
        ("listener.max_connections", config.listener.max_connections as u64),
        ("listener.buffer_capacity", config.listener.buffer_capacity as u64),
        ("listener.out_queue", config.listener.out_queue as u64),
        ("auth.guard_interval_ms", config.auth.guard_interval_ms),
        ("auth.handshake_timeout_ms", config.auth.handshake_timeout_ms),
        ("routing.replicas", config.routing.replicas as u64),
        ("routing.pick_attempts", config.routing.pick_attempts as u64),
        ("routing.response_timeout_ms", config.routing.response_timeout_ms),
        ("upstream.check_interval_ms", config.upstream.check_interval_ms),
        ("upstream.buffer_capacity", config.upstream.buffer_capacity as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.targets.len() > MAX_TARGETS {
        errors.push(ValidationError::new(
            "targets",
            format!("at most {MAX_TARGETS} targets are supported"),
        ));
    }

    let mut ids = HashSet::new();
    let mut services = HashSet::new();
    for (i, target) in config.targets.iter().enumerate() {
        if !ids.insert(target.id) {
            errors.push(ValidationError::new(
                format!("targets[{i}].id"),
                format!("duplicate target id {}", target.id),
            ));
        }
        if target.name.is_empty() {
            errors.push(ValidationError::new(format!("targets[{i}].name"), "must not be empty"));
        }
        if target.address.is_empty() {
            errors.push(ValidationError::new(format!("targets[{i}].address"), "must not be empty"));
        }
        if target.timeout_ms == 0 {
            errors.push(ValidationError::new(
                format!("targets[{i}].timeout_ms"),
                "must be greater than zero",
            ));
        }
        if target.out_queue == 0 {
            errors.push(ValidationError::new(
                format!("targets[{i}].out_queue"),
                "must be greater than zero",
            ));
        }
        services.insert(target.name.as_str());
    }

    let mut names = HashSet::new();
    for (i, message) in config.messages.iter().enumerate() {
        let field = format!("messages[{i}]");
        if message.name.is_empty() || message.name.len() > MAX_NAME_LEN {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("must be 1..={MAX_NAME_LEN} bytes"),
            ));
        }
        if !names.insert(message.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate message '{}'", message.name),
            ));
        }
        if message.route == MessageRoute::Forward {
            match message.service.as_deref() {
                None => errors.push(ValidationError::new(
                    format!("{field}.service"),
                    "forward entries need a service",
                )),
                Some(service) if !services.contains(service) => {
                    errors.push(ValidationError::new(
                        format!("{field}.service"),
                        format!("no target serves '{service}'"),
                    ))
                }
                Some(_) => {}
            }
        }
    }

    if let Some(service) = &config.routing.offline_service {
        if !services.contains(service.as_str()) {
            errors.push(ValidationError::new(
                "routing.offline_service",
                format!("no target serves '{service}'"),
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<std::net::SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "not a socket address",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
