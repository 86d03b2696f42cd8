//! Rate limiter facade and the idle-bucket reaper.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::BucketStore;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Admission facade over the bucket store.
///
/// Construction spawns the reaper, which evicts buckets idle for longer
/// than twice the cleanup interval, so a bucket survives at least one full
/// interval of silence before eviction, with a clear margin on top.
/// `stop` cancels the reaper and waits for it; call it once at shutdown.
pub struct Limiter {
    store: Arc<BucketStore>,
    cancel: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Limiter {
    pub fn new(store: BucketStore, cleanup_interval: Duration) -> Self {
        let cleanup_interval = if cleanup_interval.is_zero() {
            tracing::warn!(
                default = ?DEFAULT_CLEANUP_INTERVAL,
                "invalid cleanup interval, using default"
            );
            DEFAULT_CLEANUP_INTERVAL
        } else {
            cleanup_interval
        };

        let store = Arc::new(store);
        let cancel = CancellationToken::new();
        let reaper = tokio::spawn(reap_loop(
            Arc::clone(&store),
            cleanup_interval,
            cancel.clone(),
        ));

        Self {
            store,
            cancel,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// True when one token was taken for `client_id`.
    ///
    /// A client whose bucket cannot be created is refused.
    pub async fn allow(&self, client_id: &str) -> bool {
        match self.store.get_or_create(client_id).await {
            Some(bucket) => bucket.allow(),
            None => {
                tracing::error!(client = client_id, "no bucket available, refusing request");
                false
            }
        }
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.store.tracked_clients()
    }

    /// Signals the reaper to exit and waits for it to finish.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let reaper = self.reaper.lock().unwrap().take();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }
        tracing::info!("rate limiter stopped");
    }
}

async fn reap_loop(store: Arc<BucketStore>, interval: Duration, cancel: CancellationToken) {
    let threshold = interval * 2;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // consume the immediate first tick

    tracing::info!(?interval, ?threshold, "bucket reaper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = store.remove_inactive(threshold);
                if removed > 0 {
                    tracing::info!(removed, "evicted inactive buckets");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("bucket reaper stopping");
                break;
            }
        }
    }
}
