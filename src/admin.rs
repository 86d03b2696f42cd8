//! Administration API for custom client limits.
//!
//! A thin HTTP translator over a [`LimitManager`]: upsert, read, and
//! delete per-client limits under `/admin/limits`. This plane is never
//! rate limited and never touches the proxy hot path.

use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ratelimit::{ClientLimit, LimitManager};
use crate::response::{self, HttpBody};

/// Path prefix the admin handler owns.
pub const ADMIN_PREFIX: &str = "/admin/limits";

#[derive(Debug, Deserialize)]
struct SetLimitRequest {
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    capacity: i64,
    #[serde(default)]
    rate: f64,
}

#[derive(Debug, Serialize)]
struct LimitRecord {
    client_id: String,
    capacity: i64,
    rate: f64,
}

/// HTTP handler for `/admin/limits`.
#[derive(Clone)]
pub struct AdminApi {
    manager: Arc<dyn LimitManager>,
}

impl AdminApi {
    pub fn new(manager: Arc<dyn LimitManager>) -> Self {
        Self { manager }
    }

    /// Routes `/admin/limits[/{client_id}]` by method.
    pub async fn handle(&self, req: Request<HttpBody>) -> Response<HttpBody> {
        let client_id = req
            .uri()
            .path()
            .strip_prefix(ADMIN_PREFIX)
            .unwrap_or("")
            .trim_matches('/')
            .to_string();
        let method = req.method().clone();

        match method {
            Method::POST if client_id.is_empty() => self.set_limit(req).await,
            Method::POST => response::respond_with_error(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed (POST expects no client ID in path)",
            ),
            Method::GET if !client_id.is_empty() => self.get_limit(&client_id).await,
            Method::GET => response::respond_with_error(
                StatusCode::NOT_IMPLEMENTED,
                "Listing limits is not implemented",
            ),
            Method::DELETE if !client_id.is_empty() => self.delete_limit(&client_id).await,
            Method::DELETE => response::respond_with_error(
                StatusCode::METHOD_NOT_ALLOWED,
                "Method Not Allowed (DELETE expects client ID in path)",
            ),
            _ => response::respond_with_error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
        }
    }

    async fn set_limit(&self, req: Request<HttpBody>) -> Response<HttpBody> {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return response::respond_with_error(
                    StatusCode::BAD_REQUEST,
                    &format!("Invalid request body: {e}"),
                )
            }
        };
        let parsed: SetLimitRequest = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return response::respond_with_error(
                    StatusCode::BAD_REQUEST,
                    &format!("Invalid request body: {e}"),
                )
            }
        };

        if parsed.client_id.is_empty() {
            return response::respond_with_error(StatusCode::BAD_REQUEST, "client_id is required");
        }
        if parsed.capacity <= 0 {
            return response::respond_with_error(
                StatusCode::BAD_REQUEST,
                "capacity must be positive",
            );
        }
        if parsed.rate <= 0.0 {
            return response::respond_with_error(StatusCode::BAD_REQUEST, "rate must be positive");
        }

        let limit = ClientLimit {
            capacity: parsed.capacity,
            rate: parsed.rate,
        };
        match self.manager.set_limit(&parsed.client_id, limit).await {
            Ok(()) => response::respond_with_json(
                StatusCode::OK,
                &LimitRecord {
                    client_id: parsed.client_id,
                    capacity: parsed.capacity,
                    rate: parsed.rate,
                },
            ),
            Err(e) => response::respond_with_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to set limit: {e}"),
            ),
        }
    }

    async fn get_limit(&self, client_id: &str) -> Response<HttpBody> {
        match self.manager.get_limit(client_id).await {
            Some(limit) => response::respond_with_json(
                StatusCode::OK,
                &LimitRecord {
                    client_id: client_id.to_string(),
                    capacity: limit.capacity,
                    rate: limit.rate,
                },
            ),
            None => response::respond_with_error(
                StatusCode::NOT_FOUND,
                &format!("Limit not found for client {client_id}"),
            ),
        }
    }

    async fn delete_limit(&self, client_id: &str) -> Response<HttpBody> {
        match self.manager.delete_limit(client_id).await {
            Ok(()) => response::no_content(),
            Err(e) => response::respond_with_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to delete limit: {e}"),
            ),
        }
    }
}
