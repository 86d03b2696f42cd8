//! Shared HTTP response plumbing.
//!
//! All handlers in this crate speak `Response<HttpBody>`, a boxed body
//! that can wrap both buffered JSON payloads and streamed upstream
//! responses. Error responses share one JSON shape:
//! `{"code": <status>, "message": <text>}`.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The single body type used by every handler and the proxy leg.
pub type HttpBody = BoxBody<Bytes, BoxError>;

/// The uniform JSON error envelope sent to clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

/// Wraps a buffered payload into the shared body type.
pub fn full(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Boxes any compatible body (notably streamed upstream bodies) into the
/// shared body type.
pub fn boxed<B>(body: B) -> HttpBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// Sends a JSON error body with the given status.
pub fn respond_with_error(status: StatusCode, message: &str) -> Response<HttpBody> {
    tracing::error!(code = status.as_u16(), message, "responding with error");
    let body = serde_json::to_vec(&ApiError {
        code: status.as_u16(),
        message: message.to_string(),
    })
    .unwrap_or_else(|_| br#"{"code":500,"message":"Failed to generate response"}"#.to_vec());

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json; charset=utf-8")
        .body(full(body))
        .unwrap()
}

/// Sends a serializable payload as JSON with the given status.
pub fn respond_with_json<T: Serialize>(status: StatusCode, payload: &T) -> Response<HttpBody> {
    match serde_json::to_vec(payload) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(full(body))
            .unwrap(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response payload");
            respond_with_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate response",
            )
        }
    }
}

/// An empty 204 response.
pub fn no_content() -> Response<HttpBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(full(Bytes::new()))
        .unwrap()
}
