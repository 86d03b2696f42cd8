//! Per-client admission gate for the proxy path.

use std::sync::Arc;

use hyper::{Response, StatusCode};

use crate::response::{self, HttpBody};

use super::limiter::Limiter;

/// Gates data-plane requests on the rate limiter.
///
/// The admin plane is wired around this filter, not through it.
pub struct RateLimitFilter {
    limiter: Arc<Limiter>,
}

impl RateLimitFilter {
    pub fn new(limiter: Arc<Limiter>) -> Self {
        Self { limiter }
    }

    /// Admits or refuses the request from `remote_addr`.
    ///
    /// On refusal, returns the 429 response to send.
    pub async fn check(&self, remote_addr: &str, path: &str) -> Result<(), Response<HttpBody>> {
        let client = client_id(remote_addr);
        if self.limiter.allow(&client).await {
            tracing::debug!(client = %client, path, "request allowed");
            Ok(())
        } else {
            tracing::warn!(client = %client, path, "rate limit exceeded");
            Err(response::respond_with_error(
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded",
            ))
        }
    }
}

/// Derives the client identifier from a transport address.
///
/// Drops everything from the last colon (the port), then unwraps a
/// bracketed IPv6 literal. An address with no colon is used whole.
pub fn client_id(remote_addr: &str) -> String {
    let mut id = match remote_addr.rfind(':') {
        Some(pos) => &remote_addr[..pos],
        None => remote_addr,
    };
    if id.starts_with('[') && id.ends_with(']') {
        id = &id[1..id.len() - 1];
    }
    id.to_string()
}
