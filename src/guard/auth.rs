//! Authorization timeout guard.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::net::registry::ConnectionRegistry;

pub struct AuthGuard {
    registry: ConnectionRegistry,
    interval: Duration,
}

impl AuthGuard {
    pub fn new(registry: ConnectionRegistry, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Charge elapsed time to every pending client and close the expired.
    pub fn scan(&self, now: Instant) -> usize {
        let mut closed = 0;
        for conn in self.registry.grab_all() {
            if conn.tick_auth(now) {
                tracing::warn!(
                    handle = %conn.handle(),
                    peer_addr = %conn.peer(),
                    "Authorization timed out, closing"
                );
                conn.close();
                closed += 1;
            }
        }
        closed
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Auth guard starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan(Instant::now());
                }
                _ = shutdown.recv() => {
                    tracing::info!("Auth guard received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
