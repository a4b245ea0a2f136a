//! HTTP surface.
//!
//! - [`admin`]: operator endpoints (cache clear/stats, database status/reload),
//!   `/health` and `/metrics`
//! - [`query`]: `GET /api/{data_type}/{endpoint}` served through the gateway

pub mod admin;
pub mod query;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::gateway::{Gateway, ServeError};

/// Application state shared across handlers.
pub struct AppState {
    pub gateway: Gateway,
    /// Re-read by `POST /admin/database/reload`.
    pub config_path: PathBuf,
    pub request_timeout: Duration,
    pub start_time: Instant,
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let layers = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.request_timeout))
        .layer(CorsLayer::permissive());

    Router::new()
        .route("/admin/cache/clear", post(admin::clear_cache))
        .route("/admin/cache/stats", get(admin::cache_stats))
        .route("/admin/database/status", get(admin::database_status))
        .route("/admin/database/reload", post(admin::reload))
        .route("/health", get(admin::health))
        .route("/metrics", get(admin::metrics))
        .route("/api/{data_type}/{endpoint}", get(query::serve))
        .layer(layers)
        .with_state(state)
}

/// JSON error body with an optional `Retry-After`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self {
        let status = match &err {
            ServeError::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            ServeError::OriginUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServeError::ComputeFailed(_) => StatusCode::BAD_GATEWAY,
        };
        let retry_after = match &err {
            ServeError::AdmissionRejected { retry_after, .. } => Some(*retry_after),
            _ => None,
        };
        Self {
            status,
            message: err.to_string(),
            retry_after,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.retry_after {
            Some(wait) => json!({
                "error": self.message,
                "retry_after_ms": wait.as_millis() as u64,
            }),
            None => json!({ "error": self.message }),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(wait) = self.retry_after {
            // Whole seconds, rounded up so a client never retries early.
            let secs = wait.as_millis().div_ceil(1000).max(1) as u64;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
