//! Operator endpoints.
//!
//! - POST /admin/cache/clear?pattern=<glob>
//! - GET /admin/cache/stats
//! - GET /admin/database/status
//! - POST /admin/database/reload
//! - GET /health
//! - GET /metrics

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::backend::CacheError;
use crate::cache::store::CacheStats;
use crate::config::Config;
use crate::gateway::GatewayError;
use crate::router::{EndpointStatus, Health};
use crate::server::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ClearParams {
    /// Glob over cache keys; everything when absent.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub pattern: String,
    pub deleted_count: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub in_flight: usize,
    pub tracked_subjects: usize,
}

#[derive(Debug, Serialize)]
pub struct DatabaseStatusResponse {
    pub endpoints: Vec<EndpointStatus>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    pub endpoints: Vec<EndpointStatus>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub cache_backend: &'static str,
    pub endpoints_up: usize,
    pub endpoints_total: usize,
}

pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClearParams>,
) -> Result<Json<ClearResponse>, ApiError> {
    let pattern = params.pattern.unwrap_or_else(|| "*".to_string());
    info!(pattern = %pattern, "Cache clear requested");
    match state.gateway.clear(&pattern).await {
        Ok(deleted_count) => Ok(Json(ClearResponse {
            pattern,
            deleted_count,
        })),
        Err(GatewayError::Cache(e @ CacheError::InvalidPattern { .. })) => {
            Err(ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => {
            warn!(error = %e, "Cache clear failed");
            Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        cache: state.gateway.cache_stats().await,
        in_flight: state.gateway.in_flight(),
        tracked_subjects: state.gateway.limiter().tracked_subjects(),
    })
}

pub async fn database_status(State(state): State<Arc<AppState>>) -> Json<DatabaseStatusResponse> {
    Json(DatabaseStatusResponse {
        endpoints: state.gateway.database_status().await,
    })
}

/// Re-read the config file and apply tiers, TTLs and endpoint priority.
pub async fn reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    let config = Config::load_existing(&state.config_path).map_err(|e| {
        warn!(path = %state.config_path.display(), error = %e, "Reload rejected");
        ApiError::new(StatusCode::BAD_REQUEST, format!("{e:#}"))
    })?;
    state.gateway.reload(&config).await.map_err(|e| {
        warn!(error = %e, "Reload failed");
        match e {
            GatewayError::Config(_) => ApiError::new(StatusCode::BAD_REQUEST, e.to_string()),
            _ => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    })?;
    Ok(Json(ReloadResponse {
        reloaded: true,
        endpoints: state.gateway.database_status().await,
    }))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let endpoints = state.gateway.database_status().await;
    let endpoints_up = endpoints
        .iter()
        .filter(|e| e.health == Health::Up)
        .count();
    Json(HealthResponse {
        status: if endpoints_up > 0 { "ok" } else { "degraded" },
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache_backend: state.gateway.cache_backend(),
        endpoints_up,
        endpoints_total: endpoints.len(),
    })
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.gateway.metrics().render(),
    )
}
