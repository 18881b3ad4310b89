//! Message forward table.
//!
//! Maps a message name to where it goes and whether the sender must be
//! authorized. Built once at startup; read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{MessageConfig, MessageRoute};
use crate::net::connection::{ClientConnection, Outbound};
use crate::protocol::envelope::names;
use crate::protocol::frame::Frame;

/// Handler answering a message inside the gateway.
pub type LocalHandler = Arc<dyn Fn(&ClientConnection, &Frame) -> Option<Outbound> + Send + Sync>;

/// Destination of a message.
#[derive(Clone)]
pub enum Route {
    /// Client → backend service class.
    Forward { service: String, awaits_reply: bool },
    /// Backend → client.
    Client,
    /// Answered by the gateway itself.
    Local(LocalHandler),
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Forward {
                service,
                awaits_reply,
            } => f
                .debug_struct("Forward")
                .field("service", service)
                .field("awaits_reply", awaits_reply)
                .finish(),
            Route::Client => f.write_str("Client"),
            Route::Local(_) => f.write_str("Local(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForwardEntry {
    pub name: String,
    pub route: Route,
    pub auth_required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardTable {
    entries: HashMap<String, ForwardEntry>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in `gateway.ping` handler.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register_local(names::PING, false, |_, frame: &Frame| {
            Some(Outbound::new(names::PONG, frame.payload.clone()))
        });
        table
    }

    /// Build from `[[messages]]` on top of the defaults.
    pub fn from_config(messages: &[MessageConfig]) -> Self {
        let mut table = Self::with_defaults();
        for message in messages {
            let route = match message.route {
                MessageRoute::Forward => Route::Forward {
                    service: message.service.clone().unwrap_or_default(),
                    awaits_reply: message.awaits_reply,
                },
                MessageRoute::Client => Route::Client,
            };
            table.register(ForwardEntry {
                name: message.name.clone(),
                route,
                auth_required: message.auth,
            });
        }
        table
    }

    /// Insert or replace an entry.
    pub fn register(&mut self, entry: ForwardEntry) -> Option<ForwardEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    pub fn register_forward(&mut self, name: &str, service: &str, auth_required: bool, awaits_reply: bool) {
        self.register(ForwardEntry {
            name: name.to_string(),
            route: Route::Forward {
                service: service.to_string(),
                awaits_reply,
            },
            auth_required,
        });
    }

    pub fn register_client(&mut self, name: &str) {
        self.register(ForwardEntry {
            name: name.to_string(),
            route: Route::Client,
            auth_required: false,
        });
    }

    pub fn register_local<F>(&mut self, name: &str, auth_required: bool, handler: F)
    where
        F: Fn(&ClientConnection, &Frame) -> Option<Outbound> + Send + Sync + 'static,
    {
        self.register(ForwardEntry {
            name: name.to_string(),
            route: Route::Local(Arc::new(handler)),
            auth_required,
        });
    }

    pub fn lookup(&self, name: &str) -> Option<&ForwardEntry> {
        self.entries.get(name)
    }

    /// Service classes referenced by forward entries.
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.entries.values().filter_map(|entry| match &entry.route {
            Route::Forward { service, .. } => Some(service.as_str()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
