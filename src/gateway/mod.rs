//! Cache-aside orchestrator.
//!
//! One call per request: admit, look up, and on a miss compute once under
//! the stampede guard and fill the cache.
//!
//! ```text
//! admit ──rejected──▶ AdmissionRejected
//!   │
//! lookup ──hit──▶ (payload, Cache)
//!   │ miss
//! single-flight compute ──err──▶ ComputeFailed / OriginUnavailable
//!   │ ok
//! store ──▶ (payload, Origin)
//! ```

pub mod error;
pub mod sweeper;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::backend::{MemoryBackend, SharedBackend};
use crate::cache::compressor::{CompressionSettings, Compressor};
use crate::cache::key::{CacheKey, KeyCodec, Params};
use crate::cache::single_flight::StampedeGuard;
use crate::cache::store::{CacheStats, CacheStore};
use crate::cache::ttl::TtlPolicy;
use crate::clock::SharedClock;
use crate::config::{CacheBackendConfig, Config};
use crate::metrics::Metrics;
use crate::ratelimit::{Admission, LimiterPolicy, RateLimiter, Tier};
use crate::router::prober::Prober;
use crate::router::{ConnectionRouter, DocumentQuery, EndpointStatus};

pub use error::{ComputeError, GatewayError, ServeError};
use sweeper::Sweeper;

/// Where a served payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cache,
    Origin,
}

#[derive(Debug, Clone)]
pub struct Served {
    /// Serialized JSON.
    pub payload: Bytes,
    pub source: Source,
    /// `None` when the request could not be keyed and bypassed the cache.
    pub key: Option<CacheKey>,
}

/// Request-time settings swapped as a unit on reload.
#[derive(Debug)]
pub(crate) struct Snapshot {
    ttl: TtlPolicy,
    codec: KeyCodec,
    idle_eviction: Duration,
}

impl Snapshot {
    fn from_config(config: &Config) -> Self {
        Self {
            ttl: TtlPolicy::new(config.cache.ttl_classes.clone(), &config.cache.data_types),
            codec: KeyCodec::new(&config.cache.param_defaults, config.cache.max_param_len),
            idle_eviction: Duration::from_secs(config.rate_limit.idle_eviction_secs),
        }
    }
}

struct Background {
    prober: Prober,
    sweeper: Sweeper,
}

/// The shared gateway instance: one per process, passed to whatever serves requests.
pub struct Gateway {
    limiter: Arc<RateLimiter>,
    store: Arc<CacheStore>,
    guard: StampedeGuard<ComputeError>,
    router: Arc<ConnectionRouter>,
    snapshot: Arc<ArcSwap<Snapshot>>,
    metrics: Arc<Metrics>,
    background: Mutex<Option<Background>>,
}

impl Gateway {
    /// Connect the configured cache backend and endpoints, then start the
    /// health prober and the sweeper.
    pub async fn new(config: &Config, clock: SharedClock) -> Result<Self, GatewayError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        let backend = open_backend(&config.cache.backend).await?;
        let router =
            ConnectionRouter::connect(&config.database, clock.clone(), metrics.clone()).await?;

        let gateway = Self::assemble(config, backend, router, clock, metrics);
        let prober = Prober::spawn(gateway.router.clone(), config.database.probe_interval());
        let sweeper = Sweeper::spawn(
            gateway.store.clone(),
            gateway.limiter.clone(),
            gateway.snapshot.clone(),
            Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
        );
        *gateway.background.lock().await = Some(Background { prober, sweeper });

        info!(
            cache = gateway.store.backend_name(),
            endpoints = config.database.endpoints.len(),
            mode = ?config.database.priority_mode,
            "Gateway ready"
        );
        Ok(gateway)
    }

    /// Build from pre-made parts without background tasks.
    pub fn from_parts(
        config: &Config,
        backend: SharedBackend,
        router: ConnectionRouter,
        clock: SharedClock,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);
        Ok(Self::assemble(config, backend, router, clock, metrics))
    }

    fn assemble(
        config: &Config,
        backend: SharedBackend,
        router: ConnectionRouter,
        clock: SharedClock,
        metrics: Arc<Metrics>,
    ) -> Self {
        let compressor = Compressor::new(CompressionSettings {
            threshold: config.cache.compress_threshold,
            level: config.cache.zstd_level,
        });
        let store = Arc::new(CacheStore::new(
            backend,
            clock.clone(),
            compressor,
            metrics.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            LimiterPolicy::new(
                config.rate_limit.tiers.clone(),
                config.rate_limit.subjects.clone(),
            ),
            clock,
            metrics.clone(),
        ));
        Self {
            limiter,
            guard: StampedeGuard::new(store.clone(), metrics.clone()),
            store,
            router: Arc::new(router),
            snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::from_config(config))),
            metrics,
            background: Mutex::new(None),
        }
    }

    /// Serve one request.
    ///
    /// `compute` runs at most once per key across concurrent callers and
    /// receives the connection router to query through. A request whose
    /// parameters cannot be keyed skips the cache and computes directly.
    pub async fn serve<F, Fut>(
        &self,
        subject: &str,
        tier: Tier,
        data_type: &str,
        endpoint: &str,
        params: &Params,
        compute: F,
    ) -> Result<Served, ServeError>
    where
        F: FnOnce(Arc<ConnectionRouter>) -> Fut,
        Fut: Future<Output = Result<Value, ComputeError>> + Send + 'static,
    {
        if let Admission::Rejected { retry_after } = self.limiter.admit(subject, tier) {
            return Err(ServeError::AdmissionRejected {
                subject: subject.to_string(),
                tier,
                retry_after,
            });
        }

        let snapshot = self.snapshot.load_full();
        let key = match snapshot.codec.encode(data_type, endpoint, params) {
            Ok(key) => key,
            Err(e) => {
                debug!(data_type, endpoint, error = %e, "request not cacheable, computing directly");
                let payload = to_payload(compute(self.router.clone())).await?;
                return Ok(Served {
                    payload,
                    source: Source::Origin,
                    key: None,
                });
            }
        };

        if let Some(payload) = self.store.get(key.as_str()).await {
            return Ok(Served {
                payload,
                source: Source::Cache,
                key: Some(key),
            });
        }

        let ttl_class = snapshot.ttl.class_for(data_type);
        let ttl = snapshot.ttl.ttl_for(data_type);
        let router = self.router.clone();
        let payload = self
            .guard
            .with_single_flight(key.as_str(), ttl_class, ttl, move || {
                to_payload(compute(router))
            })
            .await
            .map_err(|e| {
                warn!(key = %key, error = %e, "compute failed");
                ServeError::from(e)
            })?;

        Ok(Served {
            payload,
            source: Source::Origin,
            key: Some(key),
        })
    }

    /// `serve` with the subject's registered tier and a single document
    /// query routed through the failover list.
    pub async fn serve_query(
        &self,
        subject: &str,
        data_type: &str,
        endpoint: &str,
        params: &Params,
        query: DocumentQuery,
    ) -> Result<Served, ServeError> {
        let tier = self.limiter.tier_for(subject);
        self.serve(subject, tier, data_type, endpoint, params, move |router| async move {
            let docs = router.execute(&query).await?;
            Ok(Value::Array(docs))
        })
        .await
    }

    /// Swap in tier table, subject directory, TTL policy, key defaults and
    /// endpoint list from a freshly loaded config. Cache backend and
    /// compression settings stay as they were at startup.
    pub async fn reload(&self, config: &Config) -> Result<(), GatewayError> {
        config.validate()?;
        self.router.reload(&config.database).await?;
        self.limiter.reload(LimiterPolicy::new(
            config.rate_limit.tiers.clone(),
            config.rate_limit.subjects.clone(),
        ));
        self.snapshot.store(Arc::new(Snapshot::from_config(config)));
        info!("Gateway configuration reloaded");
        Ok(())
    }

    /// Delete cached entries matching `pattern`.
    pub async fn clear(&self, pattern: &str) -> Result<u64, GatewayError> {
        Ok(self.store.invalidate(pattern).await?)
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.store.stats().await
    }

    pub async fn database_status(&self) -> Vec<EndpointStatus> {
        self.router.status().await
    }

    pub fn cache_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn router(&self) -> &Arc<ConnectionRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn in_flight(&self) -> usize {
        self.guard.in_flight_count()
    }

    /// Stop the prober and sweeper. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(background) = self.background.lock().await.take() {
            background.prober.stop().await;
            background.sweeper.stop().await;
            info!("Gateway closed");
        }
    }
}

async fn to_payload<Fut>(fut: Fut) -> Result<Bytes, ComputeError>
where
    Fut: Future<Output = Result<Value, ComputeError>>,
{
    let value = fut.await?;
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| ComputeError::failed(format!("result not serializable: {e}")))
}

async fn open_backend(config: &CacheBackendConfig) -> Result<SharedBackend, GatewayError> {
    match config {
        CacheBackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        #[cfg(feature = "redis")]
        CacheBackendConfig::Redis { url, key_prefix } => Ok(Arc::new(
            crate::cache::backend::RedisBackend::connect(url, key_prefix).await?,
        )),
        #[cfg(not(feature = "redis"))]
        CacheBackendConfig::Redis { .. } => Err(GatewayError::Cache(
            crate::cache::backend::CacheError::Unavailable(
                "built without the redis feature".to_string(),
            ),
        )),
    }
}
