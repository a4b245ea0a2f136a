//! Connection router: ordered failover across backing stores.
//!
//! - [`store`]: the `DocumentStore` trait and the in-process store
//! - [`endpoint`]: endpoints and health bookkeeping
//! - [`prober`]: background health probes
//!
//! Endpoints are kept as one ordered list: preferred location first (per
//! `priority_mode`), then ascending `priority`. `execute` walks that list
//! skipping endpoints marked down; `execute_batch` fans a set of queries
//! out against the first healthy endpoint.

pub mod endpoint;
pub mod prober;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::{DatabaseConfig, EndpointConfig, PriorityMode};
use crate::metrics::Metrics;

pub use endpoint::{Endpoint, EndpointStatus, Health};
pub use store::{
    BackendError, DocumentQuery, DocumentStore, HttpStore, MemoryStore, SharedStore,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OriginError {
    #[error("all origin endpoints unavailable (tried: [{}], down: [{}])", tried.join(", "), down.join(", "))]
    Unavailable { tried: Vec<String>, down: Vec<String> },

    #[error("endpoint {endpoint} rejected the query: {message}")]
    Rejected { endpoint: String, message: String },

    #[error("query failed on {endpoint}: {error}")]
    Failed {
        endpoint: String,
        error: BackendError,
    },
}

/// Router knobs taken from [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub priority_mode: PriorityMode,
    pub query_timeout: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub batch_concurrency: usize,
}

impl From<&DatabaseConfig> for RouterSettings {
    fn from(db: &DatabaseConfig) -> Self {
        Self {
            priority_mode: db.priority_mode,
            query_timeout: db.query_timeout(),
            probe_timeout: db.probe_timeout(),
            failure_threshold: db.failure_threshold,
            batch_concurrency: db.batch_concurrency.max(1),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

pub type QueryResult = Result<Vec<Value>, OriginError>;

pub struct ConnectionRouter {
    endpoints: ArcSwap<Vec<Arc<Endpoint>>>,
    settings: ArcSwap<RouterSettings>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl ConnectionRouter {
    pub fn new(
        endpoints: Vec<Endpoint>,
        settings: RouterSettings,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        let ordered = order_endpoints(
            endpoints.into_iter().map(Arc::new).collect(),
            settings.priority_mode,
        );
        Self {
            endpoints: ArcSwap::from_pointee(ordered),
            settings: ArcSwap::from_pointee(settings),
            clock,
            metrics,
        }
    }

    /// Open every configured endpoint's store.
    pub async fn connect(
        db: &DatabaseConfig,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Result<Self, BackendError> {
        let mut endpoints = Vec::with_capacity(db.endpoints.len());
        for cfg in &db.endpoints {
            let store = store::open_store(&cfg.address).await?;
            info!(endpoint = %cfg.name, address = %cfg.address, location = ?cfg.location, "Endpoint opened");
            endpoints.push(Endpoint::new(cfg.clone(), store));
        }
        Ok(Self::new(endpoints, RouterSettings::from(db), clock, metrics))
    }

    /// Run `query` on the first endpoint that answers.
    pub async fn execute(&self, query: &DocumentQuery) -> QueryResult {
        let endpoints = self.endpoints.load_full();
        let settings = self.settings.load_full();
        let mut tried = Vec::new();
        let mut down = Vec::new();

        for endpoint in endpoints.iter() {
            if endpoint.health().await == Health::Down {
                down.push(endpoint.name().to_string());
                continue;
            }
            tried.push(endpoint.name().to_string());

            match self.run_on(endpoint, query, &settings).await {
                Ok(docs) => return Ok(docs),
                Err(BackendError::Query(message)) => {
                    return Err(OriginError::Rejected {
                        endpoint: endpoint.name().to_string(),
                        message,
                    });
                }
                Err(e) => {
                    warn!(endpoint = endpoint.name(), error = %e, "failing over to next endpoint");
                }
            }
        }

        warn!(?tried, ?down, collection = %query.collection, "no endpoint could serve the query");
        Err(OriginError::Unavailable { tried, down })
    }

    /// Run every query concurrently on the currently healthy endpoint.
    ///
    /// Results come back in input order; each query succeeds or fails on
    /// its own.
    pub async fn execute_batch(&self, queries: Vec<DocumentQuery>) -> Vec<QueryResult> {
        let settings = self.settings.load_full();
        let Some(endpoint) = self.active_endpoint().await else {
            let down: Vec<String> = self
                .endpoints
                .load()
                .iter()
                .map(|e| e.name().to_string())
                .collect();
            return queries
                .iter()
                .map(|_| {
                    Err(OriginError::Unavailable {
                        tried: Vec::new(),
                        down: down.clone(),
                    })
                })
                .collect();
        };

        debug!(endpoint = endpoint.name(), queries = queries.len(), "fanning out batch");
        let endpoint = &endpoint;
        let settings = &settings;
        stream::iter(queries)
            .map(|query| async move {
                self.run_on(endpoint, &query, settings)
                    .await
                    .map_err(|error| match error {
                        BackendError::Query(message) => OriginError::Rejected {
                            endpoint: endpoint.name().to_string(),
                            message,
                        },
                        error => OriginError::Failed {
                            endpoint: endpoint.name().to_string(),
                            error,
                        },
                    })
            })
            .buffered(settings.batch_concurrency)
            .collect()
            .await
    }

    async fn run_on(
        &self,
        endpoint: &Endpoint,
        query: &DocumentQuery,
        settings: &RouterSettings,
    ) -> Result<Vec<Value>, BackendError> {
        let result = match tokio::time::timeout(settings.query_timeout, endpoint.store().find(query))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(settings.query_timeout)),
        };

        let outcome = match &result {
            Ok(_) => {
                endpoint.record_success().await;
                "ok"
            }
            Err(e) if e.is_endpoint_fault() => {
                let health = endpoint
                    .record_failure(e, settings.failure_threshold)
                    .await;
                warn!(endpoint = endpoint.name(), error = %e, %health, "endpoint query failed");
                "error"
            }
            Err(_) => "rejected",
        };
        self.metrics
            .origin_queries
            .with_label_values(&[endpoint.name(), outcome])
            .inc();
        result
    }

    /// First endpoint that is up, else the first degraded one.
    pub async fn active_endpoint(&self) -> Option<Arc<Endpoint>> {
        let endpoints = self.endpoints.load_full();
        let mut degraded = None;
        for endpoint in endpoints.iter() {
            match endpoint.health().await {
                Health::Up => return Some(endpoint.clone()),
                Health::Degraded if degraded.is_none() => degraded = Some(endpoint.clone()),
                _ => {}
            }
        }
        degraded
    }

    /// Probe every endpoint once; a successful probe restores `Up`.
    pub async fn probe_all(&self) {
        let endpoints = self.endpoints.load_full();
        let timeout = self.settings.load().probe_timeout;
        let probes = endpoints.iter().map(|endpoint| async move {
            let outcome = match tokio::time::timeout(timeout, endpoint.store().ping()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::Timeout(timeout)),
            };
            let before = endpoint.health().await;
            let after = endpoint
                .record_probe(self.clock.now_millis(), outcome)
                .await;
            if before != after {
                info!(endpoint = endpoint.name(), from = %before, to = %after, "endpoint health changed");
            }
        });
        futures::future::join_all(probes).await;
    }

    pub async fn status(&self) -> Vec<EndpointStatus> {
        let endpoints = self.endpoints.load_full();
        let mut out = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            out.push(endpoint.status().await);
        }
        out
    }

    pub fn endpoints(&self) -> Arc<Vec<Arc<Endpoint>>> {
        self.endpoints.load_full()
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .load()
            .iter()
            .find(|e| e.name() == name)
            .cloned()
    }

    /// Apply a new endpoint list and priority mode.
    ///
    /// Endpoints whose name and address are unchanged keep their store and
    /// health history; new or re-addressed ones are opened fresh.
    pub async fn reload(&self, db: &DatabaseConfig) -> Result<(), BackendError> {
        let current: HashMap<String, Arc<Endpoint>> = self
            .endpoints
            .load()
            .iter()
            .map(|e| (e.name().to_string(), e.clone()))
            .collect();

        let mut next = Vec::with_capacity(db.endpoints.len());
        for cfg in &db.endpoints {
            let endpoint = match current.get(&cfg.name) {
                Some(existing) if existing.config().address == cfg.address => {
                    existing.with_config(cfg.clone())
                }
                _ => Endpoint::new(cfg.clone(), store::open_store(&cfg.address).await?),
            };
            next.push(Arc::new(endpoint));
        }

        let settings = RouterSettings::from(db);
        let ordered = order_endpoints(next, settings.priority_mode);
        let order: Vec<&str> = ordered.iter().map(|e| e.name()).collect();
        info!(?order, mode = ?settings.priority_mode, "endpoint list reloaded");
        self.endpoints.store(Arc::new(ordered));
        self.settings.store(Arc::new(settings));
        Ok(())
    }
}

fn order_endpoints(mut endpoints: Vec<Arc<Endpoint>>, mode: PriorityMode) -> Vec<Arc<Endpoint>> {
    let preferred = mode.preferred();
    endpoints.sort_by_key(|e| {
        let cfg: &EndpointConfig = e.config();
        (cfg.location != preferred, cfg.priority)
    });
    endpoints
}
