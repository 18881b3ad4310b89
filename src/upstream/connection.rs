//! Persistent link to one backend target.
//!
//! # Responsibilities
//! - Drive `UnConnected → Connecting → Verify → Connected`
//! - Join the service loader once registered; leave it on close
//! - Drain the outbound queue, waiting a bounded time for `Connected`
//! - Hand decoded backend envelopes to the router
//!
//! # Design Decisions
//! - Reconnecting is the reconnect guard's job; the send path only waits
//! - A generation counter stops a stale reader or connect attempt from
//!   closing or promoting a newer link
//! - Write failures drop the message; they do not close the link
//! - A write that outlasts the target timeout closes the link, since a
//!   backend that stopped reading would otherwise hold the writer forever

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::load_balancer::{Loader, RingMember};
use crate::observability::metrics;
use crate::protocol::envelope::{decode_envelope, encode_envelope, Envelope, RegisterProtocol};
use crate::resilience::RetryPolicy;
use crate::routing::correlation::{PendingCorrelation, ReplyOutcome};
use crate::upstream::target::{BackendTarget, ConnState};
use crate::upstream::UpstreamError;

/// Settings shared by every backend link.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub gateway_id: u32,
    pub retry: RetryPolicy,
    pub buffer_capacity: usize,
}

#[derive(Debug)]
pub struct BackendConnection {
    target: Arc<BackendTarget>,
    settings: LinkSettings,
    loader: Weak<Loader>,
    register: Arc<dyn RegisterProtocol>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    queue: mpsc::Sender<Envelope>,
    replies: mpsc::Sender<Envelope>,
}

impl BackendConnection {
    /// Create an unconnected link. The returned receiver feeds
    /// [`run_sender`](Self::run_sender).
    pub fn new(
        target: Arc<BackendTarget>,
        settings: LinkSettings,
        loader: Weak<Loader>,
        register: Arc<dyn RegisterProtocol>,
        replies: mpsc::Sender<Envelope>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (queue, rx) = mpsc::channel(target.out_queue.max(1));
        let conn = Arc::new(Self {
            target,
            settings,
            loader,
            register,
            writer: tokio::sync::Mutex::new(None),
            reader: parking_lot::Mutex::new(None),
            generation: AtomicU64::new(0),
            queue,
            replies,
        });
        (conn, rx)
    }

    pub fn target(&self) -> &Arc<BackendTarget> {
        &self.target
    }

    pub fn state(&self) -> ConnState {
        self.target.state()
    }

    /// Claim the `UnConnected → Connecting` transition for a new attempt.
    pub fn begin_connect(&self) -> bool {
        if self
            .target
            .transition(ConnState::UnConnected, ConnState::Connecting)
        {
            self.target.reset_timer();
            true
        } else {
            false
        }
    }

    /// Connect and send the registration request. Must follow a successful
    /// [`begin_connect`](Self::begin_connect).
    ///
    /// Success leaves the link in `Verify`; the reader completes the move to
    /// `Connected` when the registration response arrives.
    pub async fn connect(self: &Arc<Self>) -> Result<(), UpstreamError> {
        let generation = self.generation.load(Ordering::Acquire);
        let result = self.try_connect(generation).await;
        if result.is_err() && self.generation.load(Ordering::Acquire) == generation {
            self.target
                .transition(ConnState::Connecting, ConnState::UnConnected);
        }
        result
    }

    async fn try_connect(self: &Arc<Self>, generation: u64) -> Result<(), UpstreamError> {
        let address = &self.target.address;
        let stream = tokio::time::timeout(
            self.target.connect_timeout(),
            TcpStream::connect(address.as_str()),
        )
        .await
        .map_err(|_| UpstreamError::Timeout)?
        .map_err(UpstreamError::Connect)?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(target_label = %self.target.label(), error = %e, "Failed to set TCP_NODELAY");
        }
        let local_port = stream.local_addr().map(|a| a.port() as u64).unwrap_or(0);
        let (read, mut write) = stream.into_split();

        let request = self
            .register
            .request(self.settings.gateway_id, self.target.id);
        let bytes = encode_envelope(&request)?;
        write.write_all(&bytes).await.map_err(UpstreamError::Io)?;

        let mut writer = self.writer.lock().await;
        if self.generation.load(Ordering::Acquire) != generation
            || !self.target.transition(ConnState::Connecting, ConnState::Verify)
        {
            return Err(UpstreamError::Superseded);
        }
        *writer = Some(write);
        drop(writer);

        let reader = tokio::spawn(Arc::clone(self).read_loop(read, generation));
        if !self.install_reader(reader, generation) {
            return Err(UpstreamError::Superseded);
        }
        self.target.set_socket(local_port);

        tracing::debug!(
            target_label = %self.target.label(),
            address = %self.target.address,
            "Registration sent"
        );
        Ok(())
    }

    /// Keep `reader` if `generation` is still current, abort it otherwise.
    fn install_reader(&self, reader: JoinHandle<()>, generation: u64) -> bool {
        // close_generation bumps the generation before it takes the reader
        // slot, so checking under the slot lock cannot miss a close.
        let mut slot = self.reader.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            drop(slot);
            reader.abort();
            return false;
        }
        *slot = Some(reader);
        true
    }

    async fn read_loop(self: Arc<Self>, mut read: OwnedReadHalf, generation: u64) {
        let capacity = self.settings.buffer_capacity;
        let mut buf = BytesMut::with_capacity(capacity);

        let reason = 'read: loop {
            match read.read_buf(&mut buf).await {
                Ok(0) => break 'read "closed by backend",
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(target_label = %self.target.label(), error = %e, "Backend read failed");
                    break 'read "read error";
                }
            }

            loop {
                let envelope = match decode_envelope(&mut buf, capacity) {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(target_label = %self.target.label(), error = %e, "Backend frame rejected");
                        break 'read "oversized frame";
                    }
                };

                if self.register.is_response(&envelope) {
                    if let Err(reason) = self.on_register_response(&envelope) {
                        break 'read reason;
                    }
                    continue;
                }

                if self.state() != ConnState::Connected {
                    tracing::warn!(
                        target_label = %self.target.label(),
                        name = %envelope.name,
                        "Envelope before registration completed; dropped"
                    );
                    continue;
                }

                if self.replies.send(envelope).await.is_err() {
                    break 'read "router stopped";
                }
            }
        };

        // The reader is finishing on its own; don't abort it from close.
        if self.generation.load(Ordering::Acquire) == generation {
            self.reader.lock().take();
        }
        self.close_generation(generation, reason).await;
    }

    fn on_register_response(self: &Arc<Self>, envelope: &Envelope) -> Result<(), &'static str> {
        if let Err(e) = self.register.accept(envelope) {
            tracing::error!(target_label = %self.target.label(), error = %e, "Backend refused registration");
            return Err("registration rejected");
        }
        if !self.target.transition(ConnState::Verify, ConnState::Connected) {
            tracing::error!(
                target_label = %self.target.label(),
                state = self.state().as_str(),
                "Registration response in unexpected state"
            );
            return Ok(());
        }

        let Some(loader) = self.loader.upgrade() else {
            tracing::error!(target_label = %self.target.label(), "Loader no longer exists");
            return Err("loader missing");
        };

        self.target.reset_timer();
        loader.add_target(&self.target.address, self.target.virtual_id(), Arc::clone(self));
        metrics::record_backend_connected(&self.target.label(), true);
        tracing::info!(
            target_label = %self.target.label(),
            address = %self.target.address,
            "Backend connected"
        );
        Ok(())
    }

    /// Close the current link, whatever its state.
    pub async fn close(&self, reason: &str) {
        let generation = self.generation.load(Ordering::Acquire);
        self.close_generation(generation, reason).await;
    }

    async fn close_generation(&self, generation: u64, reason: &str) {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let previous = self.target.set_state(ConnState::UnConnected);
        if let Some(loader) = self.loader.upgrade() {
            loader.remove_target(&self.target.address);
        }
        self.target.set_socket(0);
        self.target.reset_timer();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        if previous == ConnState::Connected {
            metrics::record_backend_connected(&self.target.label(), false);
        }
        if previous != ConnState::UnConnected {
            tracing::info!(
                target_label = %self.target.label(),
                previous = previous.as_str(),
                reason,
                "Backend link closed"
            );
        }
    }

    /// Queue an envelope for the sender actor without waiting.
    pub fn forward(&self, envelope: Envelope) -> Result<(), UpstreamError> {
        self.queue.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UpstreamError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => UpstreamError::Closed,
        })
    }

    /// Write one envelope, first waiting up to `attempts × interval` for the
    /// link to reach `Connected`.
    pub async fn route_to_backend(&self, envelope: &Envelope) -> Result<(), UpstreamError> {
        let retry = self.settings.retry;
        if !retry
            .wait_until(|| self.target.state() == ConnState::Connected)
            .await
        {
            return Err(UpstreamError::Unreachable {
                attempts: retry.attempts,
            });
        }

        let bytes = encode_envelope(envelope)?;
        let budget = self.target.connect_timeout();
        let (generation, written) = {
            let mut writer = self.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                return Err(UpstreamError::NotConnected);
            };
            // A newer connect cannot install its writer while this lock is
            // held, so closing this generation never tears down its link.
            let generation = self.generation.load(Ordering::Acquire);
            (
                generation,
                tokio::time::timeout(budget, stream.write_all(&bytes)).await,
            )
        };

        match written {
            Ok(result) => result.map_err(UpstreamError::Io),
            Err(_) => {
                self.close_generation(generation, "write stalled").await;
                Err(UpstreamError::WriteStalled(budget))
            }
        }
    }

    /// Sender actor: drains the outbound queue one envelope at a time.
    ///
    /// A dropped request wakes its waiter in `pending` with
    /// [`ReplyOutcome::Dropped`] instead of leaving it to time out.
    pub async fn run_sender(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Envelope>,
        pending: Arc<PendingCorrelation>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                next = queue.recv() => {
                    let Some(envelope) = next else { break };
                    if let Err(e) = self.route_to_backend(&envelope).await {
                        metrics::record_dropped(e.drop_reason());
                        tracing::warn!(
                            target_label = %self.target.label(),
                            handle = %envelope.handle,
                            serial = envelope.serial,
                            name = %envelope.name,
                            bytes = envelope.payload.len(),
                            error = %e,
                            "Message to backend dropped"
                        );
                        if envelope.serial != 0 {
                            pending.wake(envelope.handle, envelope.serial, ReplyOutcome::Dropped);
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!(target_label = %self.target.label(), "Backend sender stopped");
    }
}

impl RingMember for BackendConnection {
    fn is_available(&self) -> bool {
        self.state() == ConnState::Connected
    }
}
