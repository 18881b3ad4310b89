//! Request router.
//!
//! # Responsibilities
//! - Serverward: gate on authorization, pick a backend, record correlation
//! - Clientward: wake the waiting caller, resolve the client, queue the reply
//! - Handle backend control envelopes (authorize, kick)
//! - Notify the offline service when a client goes away
//!
//! # Design Decisions
//! - No I/O under any lock: routing only queues to actor channels
//! - Every failure path removes its correlation entry
//! - Unknown names are dropped and logged; the connection stays open

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::load_balancer::LoaderSet;
use crate::net::connection::{ClientConnection, Outbound, OutboundError};
use crate::net::handle::Handle;
use crate::net::registry::ConnectionRegistry;
use crate::observability::metrics;
use crate::protocol::envelope::{names, Envelope};
use crate::protocol::frame::Frame;
use crate::routing::correlation::{PendingCorrelation, ReplyOutcome};
use crate::routing::forward::{ForwardTable, Route};
use crate::upstream::UpstreamError;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no forward entry for message {0:?}")]
    UnknownMessage(String),
    #[error("message {0:?} requires an authorized connection")]
    Unauthorized(String),
    #[error("message {0:?} cannot be routed in this direction")]
    WrongDirection(String),
    #[error("no loader for service {0:?}")]
    NoLoader(String),
    #[error("no healthy backend for service {0:?}")]
    NoBackend(String),
    #[error("client {0} is not connected")]
    UnknownHandle(Handle),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Outbound(#[from] OutboundError),
}

impl RouteError {
    /// Label for the dropped-message counter.
    pub fn drop_reason(&self) -> &'static str {
        match self {
            RouteError::UnknownMessage(_) => "unknown_message",
            RouteError::Unauthorized(_) => "unauthorized",
            RouteError::WrongDirection(_) => "wrong_direction",
            RouteError::NoLoader(_) | RouteError::NoBackend(_) => "no_backend",
            RouteError::UnknownHandle(_) => "unknown_client",
            RouteError::Upstream(e) => e.drop_reason(),
            RouteError::Outbound(OutboundError::QueueFull) => "client_queue_full",
            RouteError::Outbound(OutboundError::Closed) => "client_closed",
        }
    }
}

/// What the client reader should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub pick_attempts: usize,
    pub response_timeout: Duration,
    pub close_on_unauthorized: bool,
    pub offline_service: Option<String>,
}

/// A forwarded request whose reply the caller waits for.
#[derive(Debug)]
pub struct PendingReply {
    pub serial: u32,
    pub reply: oneshot::Receiver<ReplyOutcome>,
}

#[derive(Debug)]
pub struct RequestRouter {
    table: ForwardTable,
    loaders: LoaderSet,
    registry: ConnectionRegistry,
    pending: Arc<PendingCorrelation>,
    settings: RouterSettings,
}

impl RequestRouter {
    pub fn new(
        table: ForwardTable,
        loaders: LoaderSet,
        registry: ConnectionRegistry,
        settings: RouterSettings,
    ) -> Self {
        Self {
            table,
            loaders,
            registry,
            pending: Arc::new(PendingCorrelation::new()),
            settings,
        }
    }

    pub fn table(&self) -> &ForwardTable {
        &self.table
    }

    pub fn loaders(&self) -> &LoaderSet {
        &self.loaders
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Correlation entries, shared with the backend senders.
    pub fn pending(&self) -> &Arc<PendingCorrelation> {
        &self.pending
    }

    /// Route a decoded client frame towards its backend service.
    ///
    /// Returns the correlation to wait on when the entry expects a reply.
    pub fn route_serverward(
        &self,
        origin: &ClientConnection,
        frame: Frame,
    ) -> Result<Option<PendingReply>, RouteError> {
        let entry = self
            .table
            .lookup(&frame.name)
            .ok_or_else(|| RouteError::UnknownMessage(frame.name.clone()))?;

        if entry.auth_required && !origin.is_authorized() {
            return Err(RouteError::Unauthorized(frame.name));
        }

        let (service, awaits_reply) = match &entry.route {
            Route::Forward {
                service,
                awaits_reply,
            } => (service, *awaits_reply),
            Route::Client => return Err(RouteError::WrongDirection(frame.name)),
            Route::Local(handler) => {
                if let Some(reply) = handler(origin, &frame) {
                    origin.send(reply)?;
                }
                return Ok(None);
            }
        };

        let handle = origin.handle();
        let serial = origin.next_serial();
        let reply = awaits_reply.then(|| self.pending.insert(handle, serial));

        let sent = self
            .loaders
            .get(service)
            .ok_or_else(|| RouteError::NoLoader(service.clone()))
            .and_then(|loader| {
                loader
                    .pick(self.settings.pick_attempts)
                    .ok_or_else(|| RouteError::NoBackend(service.clone()))
            })
            .and_then(|backend| {
                backend
                    .forward(Envelope::new(handle, serial, frame.name, frame.payload))
                    .map_err(RouteError::from)
            });

        match (sent, reply) {
            (Ok(()), reply) => Ok(reply.map(|reply| PendingReply { serial, reply })),
            (Err(e), reply) => {
                if reply.is_some() {
                    let outcome = match e {
                        RouteError::NoLoader(_) | RouteError::NoBackend(_) => ReplyOutcome::NoBackend,
                        _ => ReplyOutcome::Dropped,
                    };
                    self.pending.wake(handle, serial, outcome);
                }
                Err(e)
            }
        }
    }

    /// Deliver a backend envelope to its client.
    pub fn route_clientward(&self, envelope: Envelope) -> Result<(), RouteError> {
        match envelope.name.as_str() {
            names::AUTHORIZE => {
                return if self.authorize(envelope.handle) {
                    Ok(())
                } else {
                    Err(RouteError::UnknownHandle(envelope.handle))
                };
            }
            names::KICK => {
                let conn = self
                    .registry
                    .grab(envelope.handle)
                    .ok_or(RouteError::UnknownHandle(envelope.handle))?;
                tracing::info!(handle = %envelope.handle, "Client kicked by backend");
                conn.close();
                return Ok(());
            }
            _ => {}
        }

        match self.table.lookup(&envelope.name).map(|e| &e.route) {
            Some(Route::Client) => {}
            Some(_) => return Err(RouteError::WrongDirection(envelope.name)),
            None => return Err(RouteError::UnknownMessage(envelope.name)),
        }

        if envelope.serial != 0 {
            self.pending
                .wake(envelope.handle, envelope.serial, ReplyOutcome::Delivered);
        }

        let conn = self
            .registry
            .grab(envelope.handle)
            .ok_or(RouteError::UnknownHandle(envelope.handle))?;
        conn.send(Outbound::new(envelope.name, envelope.payload))?;
        Ok(())
    }

    /// Drop a pending entry whose caller stopped waiting.
    pub fn cancel_correlation(&self, handle: Handle, serial: u32) -> bool {
        self.pending.cancel(handle, serial)
    }

    /// Mark a client authorized, stopping its countdown.
    pub fn authorize(&self, handle: Handle) -> bool {
        match self.registry.grab(handle) {
            Some(conn) => {
                conn.set_authorized();
                tracing::debug!(handle = %handle, "Client authorized");
                true
            }
            None => false,
        }
    }

    /// Route one client frame and, if it expects a reply, wait for it.
    pub async fn dispatch(&self, conn: &ClientConnection, frame: Frame) -> Disposition {
        let name = frame.name.clone();
        match self.route_serverward(conn, frame) {
            Ok(Some(pending)) => {
                let outcome = self.await_reply(conn.handle(), pending).await;
                if outcome != ReplyOutcome::Delivered {
                    tracing::debug!(handle = %conn.handle(), name = %name, outcome = ?outcome, "Request finished without reply");
                }
                Disposition::Continue
            }
            Ok(None) => Disposition::Continue,
            Err(e) => {
                metrics::record_dropped(e.drop_reason());
                match e {
                    RouteError::Unauthorized(_) => {
                        tracing::warn!(handle = %conn.handle(), name = %name, "Unauthorized message rejected");
                        if self.settings.close_on_unauthorized {
                            return Disposition::Close;
                        }
                    }
                    RouteError::UnknownMessage(_) | RouteError::WrongDirection(_) => {
                        tracing::warn!(handle = %conn.handle(), name = %name, error = %e, "Message dropped");
                    }
                    _ => {
                        tracing::error!(handle = %conn.handle(), name = %name, error = %e, "Message dropped");
                    }
                }
                Disposition::Continue
            }
        }
    }

    async fn await_reply(&self, handle: Handle, pending: PendingReply) -> ReplyOutcome {
        match tokio::time::timeout(self.settings.response_timeout, pending.reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ReplyOutcome::Dropped,
            Err(_) => {
                self.cancel_correlation(handle, pending.serial);
                ReplyOutcome::TimedOut
            }
        }
    }

    /// Forget a departed client and tell the offline service.
    pub fn client_offline(&self, handle: Handle) {
        self.pending.cancel_handle(handle);

        let Some(service) = &self.settings.offline_service else {
            return;
        };
        let backend = self
            .loaders
            .get(service)
            .and_then(|loader| loader.pick(self.settings.pick_attempts));
        let result = match backend {
            Some(backend) => backend
                .forward(Envelope::new(handle, 0, names::OFFLINE, Bytes::new()))
                .map_err(RouteError::from),
            None => Err(RouteError::NoBackend(service.clone())),
        };
        if let Err(e) = result {
            metrics::record_dropped(e.drop_reason());
            tracing::warn!(handle = %handle, service = %service, error = %e, "Offline notification dropped");
        }
    }

    /// Clientward dispatcher: drains envelopes decoded by backend readers.
    pub async fn run_clientward(
        self: Arc<Self>,
        mut replies: mpsc::Receiver<Envelope>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                next = replies.recv() => {
                    let Some(envelope) = next else { break };
                    let handle = envelope.handle;
                    let name = envelope.name.clone();
                    if let Err(e) = self.route_clientward(envelope) {
                        metrics::record_dropped(e.drop_reason());
                        tracing::warn!(handle = %handle, name = %name, error = %e, "Backend message dropped");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Clientward dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::handle::SocketId;
    use crate::net::registry::ConnectionLease;

    fn router(table: ForwardTable, close_on_unauthorized: bool) -> RequestRouter {
        let mut loaders = LoaderSet::new(8);
        loaders.ensure("world");
        RequestRouter::new(
            table,
            loaders,
            ConnectionRegistry::new(1, 8, 256).unwrap(),
            RouterSettings {
                pick_attempts: 6,
                response_timeout: Duration::from_millis(50),
                close_on_unauthorized,
                offline_service: None,
            },
        )
    }

    fn client(router: &RequestRouter) -> (ConnectionLease, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let lease = router
            .registry()
            .occupy(SocketId::new(), "127.0.0.1:1".parse().unwrap(), tx)
            .unwrap();
        (lease, rx)
    }

    fn table() -> ForwardTable {
        let mut table = ForwardTable::with_defaults();
        table.register_forward("world.enter", "world", false, true);
        table.register_forward("world.move", "world", true, false);
        table.register_client("world.state");
        table
    }

    #[test]
    fn unauthorized_message_not_forwarded() {
        let router = router(table(), false);
        let (conn, _rx) = client(&router);
        let err = router
            .route_serverward(&conn, Frame::new("world.move", Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, RouteError::Unauthorized(_)));
        assert!(router.pending().is_empty());
    }

    #[test]
    fn no_backend_wakes_caller_and_clears_entry() {
        let router = router(table(), false);
        let (conn, _rx) = client(&router);
        let err = router
            .route_serverward(&conn, Frame::new("world.enter", Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, RouteError::NoBackend(ref s) if s == "world"));
        assert!(router.pending().is_empty());
    }

    #[test]
    fn unknown_message_is_dropped() {
        let router = router(table(), false);
        let (conn, _rx) = client(&router);
        assert!(matches!(
            router.route_serverward(&conn, Frame::new("nope", Bytes::new())),
            Err(RouteError::UnknownMessage(_))
        ));
    }

    #[test]
    fn local_ping_answers_directly() {
        let router = router(table(), false);
        let (conn, mut rx) = client(&router);
        let reply = router
            .route_serverward(&conn, Frame::new(names::PING, &b"t"[..]))
            .unwrap();
        assert!(reply.is_none());
        let out = rx.try_recv().unwrap();
        assert_eq!(out.name, names::PONG);
        assert_eq!(&out.payload[..], b"t");
    }

    #[tokio::test]
    async fn clientward_reply_wakes_and_delivers() {
        let router = router(table(), false);
        let (conn, mut rx) = client(&router);
        let waiter = router.pending().insert(conn.handle(), 9);

        router
            .route_clientward(Envelope::new(conn.handle(), 9, "world.state", &b"s"[..]))
            .unwrap();

        assert_eq!(waiter.await.unwrap(), ReplyOutcome::Delivered);
        assert_eq!(rx.try_recv().unwrap().name, "world.state");
        assert!(router.pending().is_empty());
        // The grab taken for delivery was released.
        assert_eq!(conn.ref_count(), 2);
    }

    #[test]
    fn clientward_to_departed_client_fails() {
        let router = router(table(), false);
        let err = router
            .route_clientward(Envelope::new(Handle::from_u64(99), 0, "world.state", Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownHandle(_)));
    }

    #[test]
    fn authorize_and_kick_envelopes() {
        let router = router(table(), false);
        let (conn, _rx) = client(&router);
        router
            .route_clientward(Envelope::new(conn.handle(), 0, names::AUTHORIZE, Bytes::new()))
            .unwrap();
        assert!(conn.is_authorized());

        router
            .route_clientward(Envelope::new(conn.handle(), 0, names::KICK, Bytes::new()))
            .unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn unauthorized_can_close_connection() {
        let router = router(table(), true);
        let (conn, _rx) = client(&router);
        let disposition = router
            .dispatch(&conn, Frame::new("world.move", Bytes::new()))
            .await;
        assert_eq!(disposition, Disposition::Close);
    }
}
