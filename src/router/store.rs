//! Document stores behind the connection router.
//!
//! A store answers [`DocumentQuery`]s (collection + equality filter + sort +
//! limit) with JSON documents. `memory://` stores start empty, `file://`
//! stores load their collections from a JSON object of arrays, and
//! `http://`/`https://` stores forward each query to a remote document
//! service (`POST /find`, `GET /health`).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("query rejected: {0}")]
    Query(String),
}

impl BackendError {
    /// Whether the failure says something about the endpoint's health.
    pub fn is_endpoint_fault(&self) -> bool {
        !matches!(self, BackendError::Query(_))
    }
}

/// Sort order for query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// A read against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub collection: String,
    #[serde(default)]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub sort: Option<SortSpec>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl DocumentQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: Map::new(),
            sort: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.sort = Some(SortSpec {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, query: &DocumentQuery) -> Result<Vec<Value>, BackendError>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<(), BackendError>;
}

pub type SharedStore = Arc<dyn DocumentStore>;

/// In-process document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collections(collections: HashMap<String, Vec<Value>>) -> Self {
        Self {
            collections: RwLock::new(collections),
        }
    }

    /// Load `{ "collection": [ {..}, .. ], .. }` from a JSON file.
    pub async fn from_json_file(path: &Path) -> Result<Self, BackendError> {
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", path.display())))?;
        let collections: HashMap<String, Vec<Value>> = serde_json::from_str(&data)
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", path.display())))?;
        info!(
            path = %path.display(),
            collections = collections.len(),
            "Loaded document store"
        );
        Ok(Self::with_collections(collections))
    }

    pub async fn insert(&self, collection: &str, docs: impl IntoIterator<Item = Value>) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, query: &DocumentQuery) -> Result<Vec<Value>, BackendError> {
        if query.collection.is_empty() {
            return Err(BackendError::Query("collection name is empty".to_string()));
        }
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(&query.collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<Value> = docs
            .iter()
            .filter(|doc| {
                query
                    .filter
                    .iter()
                    .all(|(field, want)| doc.get(field).is_some_and(|have| loosely_equal(have, want)))
            })
            .cloned()
            .collect();

        if let Some(sort) = &query.sort {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.get(&sort.field), b.get(&sort.field));
                if sort.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Query strings arrive as text, so `"600519"` matches both a string and a number field.
fn loosely_equal(have: &Value, want: &Value) -> bool {
    if have == want {
        return true;
    }
    match (have, want) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            b.to_string() == *s
        }
        _ => false,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Remote document service reached over HTTP.
///
/// Timeouts are left to the router, which bounds every call it makes.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Client errors mean the query itself is bad; everything else is the endpoint's fault.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{status}: {body}");
    if status.is_client_error() {
        Err(BackendError::Query(message))
    } else {
        Err(BackendError::Unavailable(message))
    }
}

#[async_trait]
impl DocumentStore for HttpStore {
    async fn find(&self, query: &DocumentQuery) -> Result<Vec<Value>, BackendError> {
        let url = format!("{}/find", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(query)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{url}: {e}")))?;
        check_status(response)
            .await?
            .json::<Vec<Value>>()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{url}: malformed response: {e}")))
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{url}: {e}")))?;
        check_status(response).await.map(|_| ())
    }
}

const MEMORY_SCHEME: &str = "memory://";
const FILE_SCHEME: &str = "file://";
const HTTP_SCHEMES: [&str; 2] = ["http://", "https://"];

fn is_http_address(address: &str) -> bool {
    HTTP_SCHEMES
        .iter()
        .any(|scheme| address.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()))
}

pub fn is_supported_address(address: &str) -> bool {
    address.starts_with(MEMORY_SCHEME)
        || is_http_address(address)
        || address
            .strip_prefix(FILE_SCHEME)
            .is_some_and(|path| !path.is_empty())
}

/// Open the store an endpoint address points at.
///
/// HTTP stores connect lazily; an unreachable service shows up on the first
/// probe or query rather than here.
pub async fn open_store(address: &str) -> Result<SharedStore, BackendError> {
    if address.starts_with(MEMORY_SCHEME) {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if is_http_address(address) {
        info!(address, "Using remote document store");
        return Ok(Arc::new(HttpStore::new(address)));
    }
    if let Some(path) = address.strip_prefix(FILE_SCHEME) {
        if !path.is_empty() {
            return Ok(Arc::new(MemoryStore::from_json_file(Path::new(path)).await?));
        }
    }
    Err(BackendError::Unavailable(format!(
        "unsupported store address {address:?}"
    )))
}
