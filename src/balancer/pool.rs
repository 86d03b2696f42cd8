//! Backend pool with round-robin peer selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hyper::Uri;

use super::backend::Backend;

/// An immutable sequence of backends plus an advisory round-robin cursor.
///
/// The backend list is fixed at construction; only each backend's alive
/// flag changes at runtime. The cursor is a plain atomic position; a
/// lost update between racing selections only biases fairness briefly.
pub struct ServerPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
}

impl ServerPool {
    /// Parses `urls` into backends. Invalid URLs are skipped with a
    /// warning; the pool may come out empty.
    pub fn new(urls: &[String]) -> Self {
        let mut backends = Vec::new();
        for raw in urls {
            match raw.parse::<Uri>() {
                Ok(url) if url.scheme().is_some() && url.authority().is_some() => {
                    tracing::info!(backend = %url, "added backend");
                    backends.push(Arc::new(Backend::new(url)));
                }
                Ok(_) => {
                    tracing::warn!(url = %raw, "skipping backend URL without scheme or host");
                }
                Err(e) => {
                    tracing::warn!(url = %raw, error = %e, "skipping invalid backend URL");
                }
            }
        }
        if backends.is_empty() {
            tracing::warn!("server pool constructed with no valid backends");
        }
        Self {
            backends,
            cursor: AtomicUsize::new(0),
        }
    }

    /// All backends, in construction order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Next alive backend in round-robin order, or `None` when every
    /// backend is down.
    ///
    /// The scan starts one past the cursor and stores the chosen index
    /// back, so consecutive calls walk the live subset in strict
    /// rotation; a lone live backend is always returned.
    pub fn next_peer(&self) -> Option<Arc<Backend>> {
        let n = self.backends.len();
        if n == 0 {
            return None;
        }

        let current = self.cursor.load(Ordering::Relaxed);
        for i in 0..n {
            let idx = (current + 1 + i) % n;
            if self.backends[idx].is_alive() {
                self.cursor.store(idx, Ordering::Relaxed);
                return Some(Arc::clone(&self.backends[idx]));
            }
        }
        None
    }
}
