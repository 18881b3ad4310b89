//! Gateway assembly.
//!
//! # Data Flow
//! ```text
//! GatewayConfig
//!     → Gateway::bind (registry, loaders, backend links, router, listener)
//!     → Gateway::start (spawns every background task through Shutdown)
//!     → RunningGateway::shutdown (ordered teardown)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::config::validation::validate_config;
use crate::config::{ConfigError, GatewayConfig};
use crate::guard::{AuthGuard, ReconnectGuard};
use crate::lifecycle::Shutdown;
use crate::load_balancer::LoaderSet;
use crate::net::client::{serve_client, ClientSettings};
use crate::net::handle::Handle;
use crate::net::listener::{Listener, ListenerError};
use crate::net::registry::{ConnectionRegistry, RegistryError};
use crate::protocol::envelope::{DefaultRegister, Envelope, RegisterProtocol};
use crate::resilience::RetryPolicy;
use crate::routing::{ForwardTable, RequestRouter, RouterSettings};
use crate::upstream::target::build_targets;
use crate::upstream::{BackendConnection, ConnState, LinkSettings, UpstreamError};

/// Envelopes decoded by backend readers awaiting the clientward dispatcher.
const REPLY_QUEUE: usize = 4096;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

type BackendLink = (Arc<BackendConnection>, mpsc::Receiver<Envelope>);

/// A bound, not yet running gateway.
pub struct Gateway {
    config: GatewayConfig,
    listener: Listener,
    registry: ConnectionRegistry,
    router: Arc<RequestRouter>,
    backends: Vec<BackendLink>,
    replies: mpsc::Receiver<Envelope>,
}

impl Gateway {
    /// Build every component from `config` and bind the client listener.
    pub async fn bind(config: GatewayConfig) -> Result<Self, GatewayError> {
        let table = ForwardTable::from_config(&config.messages);
        Self::bind_with(config, table, Arc::new(DefaultRegister)).await
    }

    /// Like [`bind`](Self::bind) with a caller-built forwarding table and
    /// registration protocol.
    ///
    /// `config` is validated here too, so configs built in code get the same
    /// checks as ones loaded from a file.
    pub async fn bind_with(
        config: GatewayConfig,
        table: ForwardTable,
        register: Arc<dyn RegisterProtocol>,
    ) -> Result<Self, GatewayError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let registry = ConnectionRegistry::new(
            config.gateway.id,
            config.listener.max_connections,
            config.listener.buffer_capacity,
        )?;

        let link = LinkSettings {
            gateway_id: u32::from(config.gateway.id),
            retry: RetryPolicy::new(config.upstream.auto_err_retry, config.upstream.retry_interval()),
            buffer_capacity: config.upstream.buffer_capacity,
        };

        let (replies_tx, replies) = mpsc::channel(REPLY_QUEUE);
        let mut loaders = LoaderSet::new(config.routing.replicas);
        let mut backends = Vec::with_capacity(config.targets.len());
        for target in build_targets(&config.targets)? {
            let loader = loaders.ensure(&target.name);
            backends.push(BackendConnection::new(
                target,
                link.clone(),
                Arc::downgrade(&loader),
                Arc::clone(&register),
                replies_tx.clone(),
            ));
        }
        drop(replies_tx);

        let router = Arc::new(RequestRouter::new(
            table,
            loaders,
            registry.clone(),
            RouterSettings {
                pick_attempts: config.routing.pick_attempts,
                response_timeout: config.routing.response_timeout(),
                close_on_unauthorized: config.auth.close_on_unauthorized,
                offline_service: config.routing.offline_service.clone(),
            },
        ));

        let listener = Listener::bind(&config.listener).await?;

        tracing::info!(
            gateway = %config.gateway.name,
            worker = config.gateway.id,
            targets = backends.len(),
            messages = router.table().len(),
            "Gateway assembled"
        );

        Ok(Self {
            config,
            listener,
            registry,
            router,
            backends,
            replies,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Spawn the accept loop, guards, dispatcher and backend senders.
    pub fn start(self) -> RunningGateway {
        let Gateway {
            config,
            listener,
            registry,
            router,
            backends,
            replies,
        } = self;

        let local_addr = listener.local_addr();
        let shutdown = Shutdown::new();
        let links: Vec<_> = backends.iter().map(|(conn, _)| Arc::clone(conn)).collect();

        let client = ClientSettings {
            auth_timeout: config.auth.timeout(),
            handshake_timeout: config.auth.handshake_timeout(),
            out_queue: config.listener.out_queue,
        };
        let accept_registry = registry.clone();
        let accept_router = Arc::clone(&router);
        shutdown.spawn("accept", move |rx| {
            accept_loop(listener, accept_registry, accept_router, client, rx)
        });

        let auth = AuthGuard::new(registry.clone(), config.auth.guard_interval());
        shutdown.spawn("auth-guard", move |rx| auth.run(rx));

        let reconnect = ReconnectGuard::new(links.clone(), config.upstream.check_interval());
        shutdown.spawn("reconnect-guard", move |rx| reconnect.run(rx));

        let dispatcher = Arc::clone(&router);
        shutdown.spawn("clientward", move |rx| dispatcher.run_clientward(replies, rx));

        for (conn, queue) in backends {
            let pending = Arc::clone(router.pending());
            shutdown.spawn("backend-sender", move |rx| conn.run_sender(queue, pending, rx));
        }

        tracing::info!(address = %local_addr, tasks = shutdown.tracked(), "Gateway started");

        RunningGateway {
            local_addr,
            registry,
            router,
            backends: links,
            shutdown,
        }
    }

    /// Start, wait for `signal`, then shut down.
    pub async fn run<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        let running = self.start();
        signal.await;
        running.shutdown().await;
    }
}

async fn accept_loop(
    listener: Listener,
    registry: ConnectionRegistry,
    router: Arc<RequestRouter>,
    settings: ClientSettings,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, socket)) => {
                    tokio::spawn(serve_client(
                        stream,
                        peer,
                        socket,
                        registry.clone(),
                        Arc::clone(&router),
                        settings.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("Accept loop received shutdown signal, exiting loop");
                break;
            }
        }
    }
}

/// Handle to a started gateway.
pub struct RunningGateway {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    router: Arc<RequestRouter>,
    backends: Vec<Arc<BackendConnection>>,
    shutdown: Shutdown,
}

impl RunningGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn backends(&self) -> &[Arc<BackendConnection>] {
        &self.backends
    }

    /// Backend links currently in `Connected`.
    pub fn connected_backends(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.state() == ConnState::Connected)
            .count()
    }

    /// Stop the auth countdown for a client.
    pub fn authorize(&self, handle: Handle) -> bool {
        self.router.authorize(handle)
    }

    /// Stop accepting and stop guards, then close backends and clients.
    pub async fn shutdown(self) {
        tracing::info!("Gateway shutting down");
        self.shutdown.drain(DRAIN_TIMEOUT).await;

        for backend in &self.backends {
            backend.close("shutdown").await;
        }

        self.registry.close_all();
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !self.registry.is_empty() {
            tracing::warn!(remaining = self.registry.len(), "Clients still registered after drain");
        }
        tracing::info!("Gateway stopped");
    }
}
