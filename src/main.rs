//! HTTP reverse-proxy load balancer with per-client rate limiting.
//!
//! Spreads requests across a pool of interchangeable backends with
//! round-robin selection, probes backend liveness out of band, and
//! throttles clients with per-client token buckets whose limits can be
//! customized at runtime through an admin API.

mod admin;
mod balancer;
mod config;
mod ratelimit;
mod response;
mod server;
mod store;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminApi;
use crate::balancer::{HealthChecker, ServerPool};
use crate::config::Config;
use crate::ratelimit::{BucketStore, LimitManager, LimitProvider, Limiter, RateLimitFilter};
use crate::server::App;
use crate::store::SqliteLimitStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;
    tracing::info!(
        listen_addr = %config.listen_addr,
        backends = ?config.backends,
        health_check_interval_secs = config.health_check_interval_secs,
        health_check_timeout_secs = config.health_check_timeout_secs,
        rate_limiter_enabled = config.rate_limiter.enabled,
        "configuration loaded"
    );

    // Optional custom-limit store; the balancer runs fine without one,
    // the admin API is simply unavailable.
    let mut provider: Option<Arc<dyn LimitProvider>> = None;
    let mut manager: Option<Arc<dyn LimitManager>> = None;
    if config.rate_limiter.enabled {
        if let Some(db) = &config.rate_limiter.db {
            match SqliteLimitStore::connect(&db.path).await {
                Ok(sqlite) => {
                    let sqlite = Arc::new(sqlite);
                    provider = Some(Arc::clone(&sqlite) as Arc<dyn LimitProvider>);
                    manager = Some(sqlite);
                }
                Err(e) => tracing::error!(
                    error = %e,
                    "failed to initialize limit store, proceeding without custom limits"
                ),
            }
        }
    }

    let limiter = if config.rate_limiter.enabled {
        let store = BucketStore::new(
            config.rate_limiter.default_capacity,
            config.rate_limiter.default_refill_rate,
            provider.clone(),
        )
        .context("failed to create bucket store")?;
        Some(Arc::new(Limiter::new(
            store,
            config.rate_limiter.cleanup_interval(),
        )))
    } else {
        tracing::info!("rate limiter disabled by configuration");
        None
    };

    let pool = Arc::new(ServerPool::new(&config.backends));
    if pool.is_empty() {
        bail!("no valid backend servers were initialized, check the configuration");
    }

    let cancel = CancellationToken::new();
    let checker = HealthChecker::new(
        Arc::clone(&pool),
        config.health_check_interval(),
        config.health_check_timeout(),
    );
    let health_task = tokio::spawn(checker.run(cancel.clone()));

    let filter = limiter
        .as_ref()
        .map(|limiter| Arc::new(RateLimitFilter::new(Arc::clone(limiter))));
    if filter.is_some() {
        tracing::info!("rate limiting enabled for the balancing path");
    }
    let admin = manager.map(AdminApi::new);
    match &admin {
        Some(_) => tracing::info!("admin API enabled at /admin/limits"),
        None => tracing::info!("admin API disabled (limit database not configured)"),
    }

    let app = App::new(pool, filter, admin);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "listening");

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    server::serve(app, listener, cancel).await?;

    // Shutdown order mirrors startup in reverse: the serve loop has
    // drained, now join the background tasks and release the store.
    let _ = health_task.await;
    if let Some(limiter) = &limiter {
        limiter.stop().await;
    }
    if let Some(provider) = &provider {
        if let Err(e) = provider.close().await {
            tracing::error!(error = %e, "failed to close limit store");
        }
    }
    tracing::info!("shut down gracefully");
    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
