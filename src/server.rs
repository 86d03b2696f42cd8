//! HTTP front door: request routing, the accept loop, and graceful drain.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admin::{AdminApi, ADMIN_PREFIX};
use crate::balancer::{dispatch, ServerPool};
use crate::ratelimit::{client_id, RateLimitFilter};
use crate::response::{self, HttpBody};

/// How long in-flight connections get to drain once shutdown is signalled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a request needs: the admin plane, the optional rate-limit
/// gate, and the backend pool behind the dispatcher.
#[derive(Clone)]
pub struct App {
    pool: Arc<ServerPool>,
    filter: Option<Arc<RateLimitFilter>>,
    admin: Option<AdminApi>,
}

impl App {
    pub fn new(
        pool: Arc<ServerPool>,
        filter: Option<Arc<RateLimitFilter>>,
        admin: Option<AdminApi>,
    ) -> Self {
        Self {
            pool,
            filter,
            admin,
        }
    }

    /// Routes one request. The admin subtree is never rate limited; the
    /// balancing path is gated by the filter when one is installed.
    pub async fn handle(&self, remote: SocketAddr, req: Request<Incoming>) -> Response<HttpBody> {
        let req = req.map(response::boxed);

        if is_admin_path(req.uri().path()) {
            return match &self.admin {
                Some(admin) => admin.handle(req).await,
                None => response::respond_with_error(
                    StatusCode::NOT_IMPLEMENTED,
                    "Admin API is disabled (database not configured)",
                ),
            };
        }

        if self.pool.is_empty() {
            tracing::error!(
                method = %req.method(),
                path = req.uri().path(),
                "load balancer has no valid backends"
            );
            return response::respond_with_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Load Balancer Configuration Error",
            );
        }

        let remote = remote.to_string();
        if let Some(filter) = &self.filter {
            if let Err(refused) = filter.check(&remote, req.uri().path()).await {
                return refused;
            }
        }

        dispatch(&self.pool, &client_id(&remote), req).await
    }
}

fn is_admin_path(path: &str) -> bool {
    path.strip_prefix(ADMIN_PREFIX)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Accepts connections and serves them until `cancel` fires, then drains
/// in-flight connections with a bounded grace period.
pub async fn serve(app: App, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let app = app.clone();
                let service = service_fn(move |req| {
                    let app = app.clone();
                    async move { Ok::<_, Infallible>(app.handle(remote, req).await) }
                });
                let conn = http1::Builder::new().serve_connection(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(error = %e, "connection error");
                    }
                });
            }
            _ = cancel.cancelled() => break,
        }
    }

    tracing::info!("draining in-flight connections");
    tokio::select! {
        _ = graceful.shutdown() => tracing::info!("connections drained"),
        _ = tokio::time::sleep(DRAIN_TIMEOUT) => {
            tracing::warn!("drain timed out, closing remaining connections");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{BucketStore, LimitManager, LimitProvider, Limiter};
    use crate::store::SqliteLimitStore;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Spawns a stub backend that answers every request with its own port.
    async fn spawn_stub_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(response::full(format!(
                        "backend {}",
                        addr.port()
                    ))))
                });
                tokio::spawn(async move {
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });
        addr
    }

    /// Reserves a port with nothing listening on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    async fn spawn_app(app: App) -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = serve(app, listener, serve_cancel).await;
        });
        (addr, cancel)
    }

    fn make_pool(urls: &[String], alive: bool) -> Arc<ServerPool> {
        let pool = Arc::new(ServerPool::new(urls));
        for backend in pool.backends() {
            backend.set_alive(alive);
        }
        pool
    }

    /// Raw HTTP/1.1 exchange over a fresh connection. Returns the status
    /// code and the body.
    async fn raw_request(addr: SocketAddr, request: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();

        let status_line = raw.lines().next().unwrap();
        let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let body = raw.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
        (status, body)
    }

    async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
        raw_request(
            addr,
            &format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"),
        )
        .await
    }

    async fn http_send(addr: SocketAddr, method: &str, path: &str, body: &str) -> (u16, String) {
        raw_request(
            addr,
            &format!(
                "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        )
        .await
    }

    /// Sends `count` GETs and tallies responses per stub backend port.
    async fn spread(addr: SocketAddr, count: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..count {
            let (status, body) = http_get(addr, "/").await;
            assert_eq!(status, 200);
            *counts.entry(body).or_insert(0) += 1;
        }
        counts
    }

    #[tokio::test]
    async fn test_round_robin_spreads_across_backends() {
        let b1 = spawn_stub_backend().await;
        let b2 = spawn_stub_backend().await;
        let b3 = spawn_stub_backend().await;
        let pool = make_pool(
            &[
                format!("http://127.0.0.1:{}", b1.port()),
                format!("http://127.0.0.1:{}", b2.port()),
                format!("http://127.0.0.1:{}", b3.port()),
            ],
            true,
        );
        let (addr, cancel) = spawn_app(App::new(pool, None, None)).await;

        let counts = spread(addr, 6).await;

        assert_eq!(counts[&format!("backend {}", b1.port())], 2);
        assert_eq!(counts[&format!("backend {}", b2.port())], 2);
        assert_eq!(counts[&format!("backend {}", b3.port())], 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_dead_backend_receives_nothing() {
        let b1 = spawn_stub_backend().await;
        let b2 = spawn_stub_backend().await;
        let b3 = spawn_stub_backend().await;
        let pool = make_pool(
            &[
                format!("http://127.0.0.1:{}", b1.port()),
                format!("http://127.0.0.1:{}", b2.port()),
                format!("http://127.0.0.1:{}", b3.port()),
            ],
            true,
        );
        pool.backends()[1].set_alive(false);
        let (addr, cancel) = spawn_app(App::new(pool, None, None)).await;

        let counts = spread(addr, 6).await;

        assert_eq!(counts[&format!("backend {}", b1.port())], 3);
        assert_eq!(counts.get(&format!("backend {}", b2.port())), None);
        assert_eq!(counts[&format!("backend {}", b3.port())], 3);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_proxy_failure_demotes_backend_and_traffic_moves_on() {
        // Backend 1 claims to be alive but refuses connections.
        let dead_port = closed_port().await;
        let b2 = spawn_stub_backend().await;
        let b3 = spawn_stub_backend().await;
        let pool = make_pool(
            &[
                format!("http://127.0.0.1:{dead_port}"),
                format!("http://127.0.0.1:{}", b2.port()),
                format!("http://127.0.0.1:{}", b3.port()),
            ],
            true,
        );
        let (addr, cancel) = spawn_app(App::new(Arc::clone(&pool), None, None)).await;

        // Selection starts past index 0, so the third request lands on
        // the dead backend and comes back as a 502.
        let (s1, _) = http_get(addr, "/").await;
        let (s2, _) = http_get(addr, "/").await;
        let (s3, body) = http_get(addr, "/").await;
        assert_eq!((s1, s2, s3), (200, 200, 502));
        assert_eq!(
            body,
            r#"{"code":502,"message":"Bad Gateway: Error connecting to backend"}"#
        );
        assert!(
            !pool.backends()[0].is_alive(),
            "failed backend should be demoted"
        );

        // With the dead peer demoted, traffic spreads over the survivors.
        let counts = spread(addr, 6).await;
        assert_eq!(counts[&format!("backend {}", b2.port())], 3);
        assert_eq!(counts[&format!("backend {}", b3.port())], 3);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_client_over_limit_gets_429_until_refill() {
        let b1 = spawn_stub_backend().await;
        let pool = make_pool(&[format!("http://127.0.0.1:{}", b1.port())], true);

        let store = BucketStore::new(3, 1.0, None).unwrap();
        let limiter = Arc::new(Limiter::new(store, Duration::from_secs(60)));
        let filter = Arc::new(RateLimitFilter::new(Arc::clone(&limiter)));
        let (addr, cancel) = spawn_app(App::new(pool, Some(filter), None)).await;

        let mut statuses = Vec::new();
        for _ in 0..5 {
            let (status, body) = http_get(addr, "/").await;
            if status == 429 {
                assert_eq!(body, r#"{"code":429,"message":"Rate limit exceeded"}"#);
            }
            statuses.push(status);
        }
        assert_eq!(statuses, vec![200, 200, 200, 429, 429]);

        // At one token per second, two seconds buy two more requests.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        let (status, _) = http_get(addr, "/").await;
        assert_eq!(status, 200);
        let (status, _) = http_get(addr, "/").await;
        assert_eq!(status, 200);

        limiter.stop().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_custom_limit_round_trip_through_admin() {
        let b1 = spawn_stub_backend().await;
        let pool = make_pool(&[format!("http://127.0.0.1:{}", b1.port())], true);

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("limits.db");
        let sqlite = Arc::new(
            SqliteLimitStore::connect(db_path.to_str().unwrap())
                .await
                .unwrap(),
        );
        let provider: Arc<dyn LimitProvider> = Arc::clone(&sqlite) as Arc<dyn LimitProvider>;
        let manager: Arc<dyn LimitManager> = sqlite;

        let store = BucketStore::new(100, 10.0, Some(provider)).unwrap();
        let limiter = Arc::new(Limiter::new(store, Duration::from_secs(60)));
        let filter = Arc::new(RateLimitFilter::new(Arc::clone(&limiter)));
        let admin = AdminApi::new(manager);
        let (addr, cancel) = spawn_app(App::new(pool, Some(filter), Some(admin))).await;

        // Install a one-request budget for the test client before its
        // bucket exists.
        let (status, body) = http_send(
            addr,
            "POST",
            "/admin/limits",
            r#"{"client_id":"127.0.0.1","capacity":1,"rate":0.5}"#,
        )
        .await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""capacity":1"#));

        // The cold miss picks up the custom limit: one 200, then 429.
        let (first, _) = http_get(addr, "/").await;
        let (second, _) = http_get(addr, "/").await;
        assert_eq!((first, second), (200, 429));

        // Reading and deleting the record through the admin plane.
        let (status, body) = http_send(addr, "GET", "/admin/limits/127.0.0.1", "").await;
        assert_eq!(status, 200);
        assert!(body.contains(r#""client_id":"127.0.0.1""#));

        let (status, _) = http_send(addr, "DELETE", "/admin/limits/127.0.0.1", "").await;
        assert_eq!(status, 204);

        let (status, _) = http_send(addr, "GET", "/admin/limits/127.0.0.1", "").await;
        assert_eq!(status, 404);

        limiter.stop().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_all_backends_down_returns_503() {
        let pool = make_pool(
            &[
                format!("http://127.0.0.1:{}", closed_port().await),
                format!("http://127.0.0.1:{}", closed_port().await),
            ],
            false,
        );
        let (addr, cancel) = spawn_app(App::new(pool, None, None)).await;

        let (status, body) = http_get(addr, "/").await;

        assert_eq!(status, 503);
        assert_eq!(
            body,
            r#"{"code":503,"message":"Service Unavailable: No backend servers available"}"#
        );

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_empty_pool_returns_500() {
        let pool = Arc::new(ServerPool::new(&[]));
        let (addr, cancel) = spawn_app(App::new(pool, None, None)).await;

        let (status, body) = http_get(addr, "/anything").await;

        assert_eq!(status, 500);
        assert_eq!(
            body,
            r#"{"code":500,"message":"Load Balancer Configuration Error"}"#
        );

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_admin_without_manager_returns_501() {
        let b1 = spawn_stub_backend().await;
        let pool = make_pool(&[format!("http://127.0.0.1:{}", b1.port())], true);
        let (addr, cancel) = spawn_app(App::new(pool, None, None)).await;

        let (status, _) = http_get(addr, "/admin/limits/1.2.3.4").await;
        assert_eq!(status, 501);

        // Similar-looking paths outside the admin subtree are proxied.
        let (status, _) = http_get(addr, "/admin/limitsextra").await;
        assert_eq!(status, 200);

        cancel.cancel();
    }

    #[test]
    fn test_admin_path_matching() {
        assert!(is_admin_path("/admin/limits"));
        assert!(is_admin_path("/admin/limits/1.2.3.4"));
        assert!(!is_admin_path("/admin/limitsextra"));
        assert!(!is_admin_path("/other"));
        assert!(!is_admin_path("/"));
    }
}
