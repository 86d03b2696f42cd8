//! A single upstream backend and its proxy leg.

use std::sync::atomic::{AtomicBool, Ordering};

use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::response::{self, HttpBody};

/// Carried on the request during dispatch: how many peer-selection
/// retries preceded the hand-off. The proxy error path demotes the
/// backend only when it is zero; retries already target other peers and
/// must not trigger cascading demotions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCount(pub usize);

/// Headers that must not travel to the upstream.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// One upstream server: its URL (immutable for the backend's life), the
/// liveness flag published by the health checker and the proxy error
/// path, and the HTTP client that forwards requests to it.
pub struct Backend {
    url: Uri,
    alive: AtomicBool,
    client: Client<HttpConnector, HttpBody>,
}

impl Backend {
    /// Creates a backend that starts out not alive; the first health
    /// probe cycle promotes it.
    pub fn new(url: Uri) -> Self {
        Self {
            url,
            alive: AtomicBool::new(false),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// `host:port` the health checker probes; the port falls back to the
    /// scheme default.
    pub fn probe_addr(&self) -> String {
        let host = self.url.host().unwrap_or("");
        let port = self.url.port_u16().unwrap_or_else(|| {
            match self.url.scheme_str() {
                Some("https") => 443,
                _ => 80,
            }
        });
        format!("{host}:{port}")
    }

    /// Forwards the request upstream and streams the response back.
    ///
    /// On upstream failure: demote when the carried retry count is zero
    /// (this backend was the first pick), otherwise only log. Either way
    /// the client sees a 502.
    pub async fn serve(&self, req: Request<HttpBody>) -> Response<HttpBody> {
        let retries = req
            .extensions()
            .get::<RetryCount>()
            .copied()
            .unwrap_or_default()
            .0;

        let outbound = match self.rewrite(req) {
            Ok(outbound) => outbound,
            Err(e) => {
                tracing::error!(backend = %self.url, error = %e, "failed to build upstream request");
                return response::respond_with_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Load Balancer Configuration Error",
                );
            }
        };

        match self.client.request(outbound).await {
            Ok(resp) => resp.map(response::boxed),
            Err(e) => {
                if retries == 0 {
                    tracing::warn!(
                        backend = %self.url,
                        error = %e,
                        "marking backend as down after proxy error"
                    );
                    self.set_alive(false);
                } else {
                    tracing::warn!(
                        backend = %self.url,
                        retries,
                        error = %e,
                        "proxy error on retried request"
                    );
                }
                response::respond_with_error(
                    StatusCode::BAD_GATEWAY,
                    "Bad Gateway: Error connecting to backend",
                )
            }
        }
    }

    /// Rewrites the request URI against this backend's URL and strips
    /// hop-by-hop headers. The original path and query are preserved.
    fn rewrite(&self, req: Request<HttpBody>) -> anyhow::Result<Request<HttpBody>> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        let mut target = self.url.clone().into_parts();
        target.path_and_query = Some(path_and_query);
        parts.uri = Uri::from_parts(target)?;

        for header in HOP_BY_HOP_HEADERS {
            parts.headers.remove(header);
        }

        Ok(Request::from_parts(parts, body))
    }
}
