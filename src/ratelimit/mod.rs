//! Per-client token-bucket rate limiting.
//!
//! A sharded map of lazily refilled token buckets, an idle-bucket reaper,
//! and the capability traits through which custom per-client limits are
//! looked up (data plane) and managed (admin plane).

mod bucket;
mod filter;
mod limiter;
mod store;

pub use bucket::Bucket;
pub use filter::{client_id, RateLimitFilter};
pub use limiter::Limiter;
pub use store::{BucketStore, ClientLimit, LimitManager, LimitProvider};
