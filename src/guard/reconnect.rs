//! Backend reconnect guard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::upstream::{BackendConnection, ConnState};

pub struct ReconnectGuard {
    backends: Vec<Arc<BackendConnection>>,
    interval: Duration,
    attempts: JoinSet<()>,
}

impl ReconnectGuard {
    pub fn new(backends: Vec<Arc<BackendConnection>>, interval: Duration) -> Self {
        Self {
            backends,
            interval,
            attempts: JoinSet::new(),
        }
    }

    /// One supervision pass over every backend.
    pub fn check(&mut self, now: Instant) {
        while self.attempts.try_join_next().is_some() {}

        for conn in &self.backends {
            match conn.state() {
                ConnState::Connected => {}
                ConnState::Connecting | ConnState::Verify => {
                    if let Some(elapsed) = conn.target().is_timed_out(now) {
                        tracing::warn!(
                            target_label = %conn.target().label(),
                            state = conn.state().as_str(),
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Backend link timed out"
                        );
                        let conn = Arc::clone(conn);
                        self.attempts.spawn(async move { conn.close("timeout").await });
                    }
                }
                ConnState::UnConnected => {
                    if conn.begin_connect() {
                        let conn = Arc::clone(conn);
                        self.attempts.spawn(async move {
                            if let Err(e) = conn.connect().await {
                                tracing::debug!(
                                    target_label = %conn.target().label(),
                                    address = %conn.target().address,
                                    error = %e,
                                    "Backend connect attempt failed"
                                );
                            }
                        });
                    }
                }
            }
        }
    }

    /// Connect attempts still running.
    pub fn in_flight(&self) -> usize {
        self.attempts.len()
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            backends = self.backends.len(),
            interval_ms = self.interval.as_millis() as u64,
            "Reconnect guard starting"
        );

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check(Instant::now());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Reconnect guard received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        self.attempts.abort_all();
        while self.attempts.join_next().await.is_some() {}
    }
}
