// src/acceptor.rs
//! HTTP front door: accepts profile records and publishes them to the queue.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use tracing::{debug, error, warn};

use crate::message::Profile;
use crate::rabbitmq::Publisher;

/// Upper bound on an accepted request body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Seconds a client is asked to wait while the queue reconnects.
pub const RETRY_AFTER_SECS: &str = "1";

/// Shared handler state: anything that can publish to the queue.
pub type SharedPublisher = Arc<dyn Publisher>;

/// Routes:
///
/// - `/put` (POST only): decode `{Name, URL}`, then publish the raw body.
///   A 503 caused by a reconnect in progress carries `Retry-After`.
/// - `GET /ready`: 200 while the queue is usable, 503 otherwise
pub fn router(publisher: SharedPublisher) -> Router {
    Router::new()
        .route("/put", any(put_profile))
        .route("/ready", get(readiness))
        .with_state(publisher)
}

async fn put_profile(
    State(publisher): State<SharedPublisher>,
    method: Method,
    body: Body,
) -> Response {
    if method != Method::POST {
        warn!(%method, "Rejected request with unsupported method");
        return (StatusCode::NOT_IMPLEMENTED, "method not supported").into_response();
    }

    let data = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(data) => data,
        Err(err) => {
            warn!("Failed to read request body: {}", err);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response();
        }
    };

    if let Err(err) = Profile::from_slice(&data) {
        warn!("Failed to decode request body: {}", err);
        return (StatusCode::BAD_REQUEST, "bad request").into_response();
    }

    match publisher.publish(&data).await {
        Ok(()) => {
            debug!(bytes = data.len(), "Profile published");
            StatusCode::OK.into_response()
        }
        Err(err) if err.is_transient() => {
            warn!(kind = err.kind(), "Queue unavailable: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
                "service unavailable",
            )
                .into_response()
        }
        Err(err) => {
            error!(kind = err.kind(), "Failed to publish message: {}", err);
            (StatusCode::SERVICE_UNAVAILABLE, "service unavailable").into_response()
        }
    }
}

async fn readiness(State(publisher): State<SharedPublisher>) -> StatusCode {
    if publisher.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
