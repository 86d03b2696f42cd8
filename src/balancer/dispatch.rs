//! Request dispatch: bounded peer selection and hand-off to the proxy leg.

use std::time::Duration;

use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};

use crate::response::{self, HttpBody};

use super::backend::RetryCount;
use super::pool::ServerPool;

/// Pause between peer-selection attempts: long enough for a health flip
/// to land, short enough not to stall the request noticeably.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Picks a live peer (retrying up to the pool size), tags the request
/// with the retry count, and hands it to the peer's proxy leg.
///
/// No live peer within the attempt budget means 503. One peer is chosen
/// per request; upstream failures past this point are the peer's own
/// error handling, not a re-dispatch.
pub async fn dispatch(
    pool: &ServerPool,
    client_ip: &str,
    mut req: Request<HttpBody>,
) -> Response<HttpBody> {
    tracing::info!(
        method = %req.method(),
        path = req.uri().path(),
        client = client_ip,
        "received request"
    );

    let max_attempts = pool.len();
    let mut attempts = 0;
    let mut peer = None;
    while attempts < max_attempts {
        match pool.next_peer() {
            Some(found) => {
                peer = Some(found);
                break;
            }
            None => {
                tracing::warn!(attempt = attempts + 1, "no alive peer found, retrying");
                attempts += 1;
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }

    let Some(peer) = peer else {
        tracing::error!(attempts = max_attempts, "no available backends");
        return response::respond_with_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable: No backend servers available",
        );
    };

    tracing::info!(backend = %peer.url(), "forwarding request");

    append_forwarded_for(&mut req, client_ip);
    req.extensions_mut().insert(RetryCount(attempts));
    peer.serve(req).await
}

/// Records this hop in `x-forwarded-for`, appending to any existing list.
fn append_forwarded_for(req: &mut Request<HttpBody>, client_ip: &str) {
    let joined = match req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&joined) {
        req.headers_mut().insert("x-forwarded-for", value);
    }
}
