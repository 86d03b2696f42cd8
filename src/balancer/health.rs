//! Periodic liveness probing of the backend pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::pool::ServerPool;

/// Probes every backend in parallel on a fixed interval and publishes
/// results through the backends' alive flags.
///
/// A probe is a bare TCP connect: cheap matters more here than endpoint
/// semantics, and it answers the only question peer selection asks.
pub struct HealthChecker {
    pool: Arc<ServerPool>,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(pool: Arc<ServerPool>, interval: Duration, timeout: Duration) -> Self {
        Self {
            pool,
            interval,
            timeout,
        }
    }

    /// Runs one probe cycle immediately, then cycles on the interval
    /// until cancelled. A cycle in flight always finishes; cancellation
    /// is observed between cycles.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            "health checker started"
        );
        self.run_cycle().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_cycle().await,
                _ = cancel.cancelled() => {
                    tracing::info!("health checker stopping");
                    break;
                }
            }
        }
    }

    /// One parallel probe fan-out over all backends, joined to completion.
    pub async fn run_cycle(&self) {
        let mut probes = JoinSet::new();
        for backend in self.pool.backends() {
            let backend = Arc::clone(backend);
            let timeout = self.timeout;
            probes.spawn(async move {
                let alive = probe(&backend.probe_addr(), timeout).await;
                backend.set_alive(alive);
                tracing::info!(backend = %backend.url(), alive, "health probe");
            });
        }
        while probes.join_next().await.is_some() {}
    }
}

/// A backend is alive when a TCP connection to it opens within `timeout`.
/// The connection is dropped as soon as it is established.
async fn probe(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
