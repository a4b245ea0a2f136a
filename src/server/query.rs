//! Market-data queries through the cache-aside gateway.
//!
//! `GET /api/{data_type}/{endpoint}?field=value&...&sort=-cap&limit=20`
//!
//! `data_type` names the collection; every other query-string pair except
//! the reserved `sort` and `limit` becomes an equality filter. The caller is
//! identified by the `x-api-key` header.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::cache::key::Params;
use crate::gateway::Source;
use crate::router::DocumentQuery;
use crate::server::{ApiError, AppState};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ANONYMOUS: &str = "anonymous";

const SORT_PARAM: &str = "sort";
const LIMIT_PARAM: &str = "limit";

pub async fn serve(
    State(state): State<Arc<AppState>>,
    Path((data_type, endpoint)): Path<(String, String)>,
    Query(raw): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    let subject = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string();

    let query = build_query(&data_type, &raw)?;
    let params: Params = raw
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect();

    let served = state
        .gateway
        .serve_query(&subject, &data_type, &endpoint, &params, query)
        .await
        .map_err(|e| {
            info!(request_id = %request_id, subject = %subject, error = %e, "Query refused");
            ApiError::from(e)
        })?;

    let cache = match served.source {
        Source::Cache => "HIT",
        Source::Origin => "MISS",
    };
    info!(
        request_id = %request_id,
        subject = %subject,
        data_type = %data_type,
        endpoint = %endpoint,
        cache,
        "Query served"
    );

    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        served.payload,
    )
        .into_response();
    let headers = response.headers_mut();
    headers.insert("x-cache", HeaderValue::from_static(cache));
    if let Ok(id) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", id);
    }
    Ok(response)
}

/// Map query-string pairs onto a document query against `data_type`.
pub fn build_query(
    data_type: &str,
    raw: &HashMap<String, String>,
) -> Result<DocumentQuery, ApiError> {
    let mut query = DocumentQuery::new(data_type);
    for (name, value) in raw {
        match name.as_str() {
            SORT_PARAM => {
                let (field, descending) = match value.strip_prefix('-') {
                    Some(field) => (field, true),
                    None => (value.as_str(), false),
                };
                if field.is_empty() {
                    return Err(ApiError::new(StatusCode::BAD_REQUEST, "sort field is empty"));
                }
                query = query.sort_by(field, descending);
            }
            LIMIT_PARAM => {
                let limit = value.parse::<usize>().map_err(|_| {
                    ApiError::new(
                        StatusCode::BAD_REQUEST,
                        format!("limit must be a non-negative integer, got {value:?}"),
                    )
                })?;
                query = query.limit(limit);
            }
            _ => query = query.filter(name.clone(), value.clone()),
        }
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_build_query_reserved_params() {
        let query = build_query(
            "stock_basic",
            &raw(&[("market", "主板"), ("sort", "-cap"), ("limit", "10")]),
        )
        .unwrap();
        assert_eq!(query.collection, "stock_basic");
        assert_eq!(query.filter.get("market"), Some(&Value::String("主板".into())));
        let sort = query.sort.unwrap();
        assert_eq!(sort.field, "cap");
        assert!(sort.descending);
        assert_eq!(query.limit, Some(10));
    }

    #[test]
    fn test_build_query_rejects_bad_limit() {
        let err = build_query("x", &raw(&[("limit", "ten")])).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(build_query("x", &raw(&[("sort", "-")])).is_err());
    }
}
