//! Client-to-bucket mapping and the custom-limit capability traits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::bucket::Bucket;

/// A per-client limit: bucket capacity and refill rate in tokens/second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientLimit {
    pub capacity: i64,
    pub rate: f64,
}

/// Read capability over a store of custom per-client limits.
///
/// Consulted once per cold miss, when a client's bucket is first created.
/// Implementations bound their own lookup time and report failures as an
/// absent limit; the data plane never fails because a provider did.
#[async_trait]
pub trait LimitProvider: Send + Sync {
    /// Returns the custom limit for `client_id`, or `None` when the
    /// client has none (or the lookup failed).
    async fn get_limit(&self, client_id: &str) -> Option<ClientLimit>;

    /// Releases backing resources. Called once at shutdown.
    async fn close(&self) -> Result<()>;
}

/// Administration capability over the same store: reads plus upserts and
/// not-found-tolerant deletes. Never used on the proxy hot path.
#[async_trait]
pub trait LimitManager: Send + Sync {
    async fn get_limit(&self, client_id: &str) -> Option<ClientLimit>;

    async fn set_limit(&self, client_id: &str, limit: ClientLimit) -> Result<()>;

    async fn delete_limit(&self, client_id: &str) -> Result<()>;
}

/// Owns every bucket, keyed by client identifier.
///
/// The map is sharded, so hot-path hits cost one shard read lock. Cold
/// misses resolve limits (possibly via the provider) with no lock held,
/// then insert through the entry API: two racing misses may both consult
/// the provider, but only one bucket is ever inserted per client, and a
/// bucket stays in place until the reaper removes it.
pub struct BucketStore {
    buckets: DashMap<String, Arc<Bucket>>,
    default_limit: ClientLimit,
    provider: Option<Arc<dyn LimitProvider>>,
}

impl BucketStore {
    /// Returns `Err` when the default parameters are not positive.
    pub fn new(
        default_capacity: i64,
        default_rate: f64,
        provider: Option<Arc<dyn LimitProvider>>,
    ) -> Result<Self> {
        if default_capacity <= 0 || default_rate <= 0.0 {
            anyhow::bail!(
                "invalid default bucket parameters: capacity={default_capacity}, rate={default_rate}"
            );
        }
        match &provider {
            Some(_) => tracing::info!("bucket store initialized with a custom limit provider"),
            None => tracing::info!("bucket store initialized with default limits only"),
        }
        Ok(Self {
            buckets: DashMap::new(),
            default_limit: ClientLimit {
                capacity: default_capacity,
                rate: default_rate,
            },
            provider,
        })
    }

    /// Returns the client's bucket, creating it on first sight.
    ///
    /// New buckets use the provider's limit when it reports one with both
    /// values positive; an invalid custom limit is logged and replaced by
    /// the defaults. `None` means the bucket could not be created and the
    /// caller should refuse the request.
    pub async fn get_or_create(&self, client_id: &str) -> Option<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.get(client_id) {
            return Some(Arc::clone(&bucket));
        }

        let limit = self.resolve_limit(client_id).await;
        match self.buckets.entry(client_id.to_string()) {
            Entry::Occupied(existing) => Some(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let Some(bucket) = Bucket::new(limit.capacity, limit.rate) else {
                    tracing::error!(
                        client = client_id,
                        capacity = limit.capacity,
                        rate = limit.rate,
                        "failed to create bucket"
                    );
                    return None;
                };
                let bucket = Arc::new(bucket);
                slot.insert(Arc::clone(&bucket));
                tracing::debug!(
                    client = client_id,
                    capacity = limit.capacity,
                    rate = limit.rate,
                    "created bucket"
                );
                Some(bucket)
            }
        }
    }

    async fn resolve_limit(&self, client_id: &str) -> ClientLimit {
        let Some(provider) = &self.provider else {
            return self.default_limit;
        };
        match provider.get_limit(client_id).await {
            Some(limit) if limit.capacity > 0 && limit.rate > 0.0 => {
                tracing::info!(
                    client = client_id,
                    capacity = limit.capacity,
                    rate = limit.rate,
                    "using custom rate limit"
                );
                limit
            }
            Some(limit) => {
                tracing::warn!(
                    client = client_id,
                    capacity = limit.capacity,
                    rate = limit.rate,
                    "ignoring invalid custom limit, using defaults"
                );
                self.default_limit
            }
            None => self.default_limit,
        }
    }

    /// Removes every bucket idle for longer than `threshold`; returns the
    /// number removed.
    pub fn remove_inactive(&self, threshold: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_inactive(threshold));
        before.saturating_sub(self.buckets.len())
    }

    /// Number of clients currently holding a bucket.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }
}
