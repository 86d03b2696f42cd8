//! Backend pool, liveness probing, and request dispatch.
//!
//! The pool owns an immutable set of backends; the health checker and
//! the proxy error path publish liveness through each backend's alive
//! flag; the dispatcher reads it during round-robin peer selection.

mod backend;
mod dispatch;
mod health;
mod pool;

pub use backend::{Backend, RetryCount};
pub use dispatch::dispatch;
pub use health::HealthChecker;
pub use pool::ServerPool;
