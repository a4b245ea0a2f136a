//! Cache store: get/set/invalidate over a shared backend.
//!
//! Backend faults never reach the caller. A failed `get` is a miss and a
//! failed `set` is dropped with a warning, so a cache outage only costs
//! recomputation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::backend::{CacheError, KeyPattern, SharedBackend};
use crate::cache::compressor::Compressor;
use crate::cache::entry::CacheEntry;
use crate::cache::ttl::TtlClass;
use crate::clock::SharedClock;
use crate::metrics::Metrics;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub writes: u64,
    pub errors: u64,
    /// `None` when the backend could not be asked.
    pub store_count: Option<u64>,
    pub backend: &'static str,
}

pub struct CacheStore {
    backend: SharedBackend,
    clock: SharedClock,
    compressor: Compressor,
    metrics: Arc<Metrics>,
}

impl CacheStore {
    pub fn new(
        backend: SharedBackend,
        clock: SharedClock,
        compressor: Compressor,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            clock,
            compressor,
            metrics,
        }
    }

    /// Look up a payload. Absent, expired, corrupt or unreachable all read as a miss.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let payload = self.lookup(key).await;
        if payload.is_some() {
            self.metrics.cache_hits.inc();
        } else {
            self.metrics.cache_misses.inc();
        }
        payload
    }

    async fn lookup(&self, key: &str) -> Option<Bytes> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(e) => {
                self.metrics.cache_errors.inc();
                warn!(key, error = %e, "cache get failed, treating as miss");
                return None;
            }
        };

        let entry = match CacheEntry::decode(key, raw) {
            Ok(entry) => entry,
            Err(e) => {
                self.metrics.cache_errors.inc();
                warn!(key, error = %e, "discarding unreadable cache entry");
                return None;
            }
        };

        let now = self.clock.now_millis();
        if entry.is_expired(now) {
            debug!(key, expires_at = entry.expires_at, now, "cache entry past expiry");
            return None;
        }

        match self.compressor.unpack(entry.payload, entry.compressed) {
            Ok(payload) => {
                debug!(key, class = %entry.ttl_class, "cache hit");
                Some(payload)
            }
            Err(e) => {
                self.metrics.cache_errors.inc();
                warn!(key, error = %e, "failed to decompress cache entry");
                None
            }
        }
    }

    /// Store a payload, overwriting any previous value. Best effort.
    pub async fn set(&self, key: &str, payload: Bytes, ttl_class: TtlClass, ttl: Duration) {
        let (stored, compressed) = match self.compressor.pack(&payload) {
            Ok(packed) => packed,
            Err(e) => {
                warn!(key, error = %e, "compression failed, storing raw payload");
                (payload, false)
            }
        };
        let entry = CacheEntry::new(
            key,
            stored,
            compressed,
            ttl_class,
            self.clock.now_millis(),
            ttl,
        );

        match self.backend.set(key, entry.encode(), ttl).await {
            Ok(()) => {
                self.metrics.cache_writes.inc();
                debug!(key, class = %ttl_class, ttl_secs = ttl.as_secs(), compressed, "cache set");
            }
            Err(e) => {
                self.metrics.cache_errors.inc();
                warn!(key, error = %e, "cache set failed, continuing without caching");
            }
        }
    }

    /// Bulk-delete keys matching a glob. Used by operators, so faults are reported.
    pub async fn invalidate(&self, pattern: &str) -> Result<u64, CacheError> {
        let pattern = KeyPattern::parse(pattern)?;
        let deleted = self.backend.delete_matching(&pattern).await?;
        tracing::info!(pattern = pattern.as_str(), deleted, "cache invalidated");
        Ok(deleted)
    }

    /// Ask the backend to drop physically expired entries.
    pub async fn purge_expired(&self) -> u64 {
        match self.backend.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache purge failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.metrics.cache_hits.get();
        let misses = self.metrics.cache_misses.get();
        let total = hits + misses;
        let store_count = match self.backend.len().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "cache size unavailable");
                None
            }
        };
        CacheStats {
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            writes: self.metrics.cache_writes.get(),
            errors: self.metrics.cache_errors.get(),
            store_count,
            backend: self.backend.name(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = CacheStore::new(
            Arc::new(MemoryBackend::new()),
            clock.clone(),
            Compressor::default(),
            Arc::new(Metrics::new().unwrap()),
        );
        (store, clock)
    }

    #[tokio::test]
    async fn test_get_after_set() {
        let (store, _clock) = store_with_clock();
        let payload = Bytes::from_static(b"{\"price\":1688.0}");
        assert_eq!(store.get("realtime_quote:get:code=600519").await, None);
        store
            .set(
                "realtime_quote:get:code=600519",
                payload.clone(),
                TtlClass::Realtime,
                Duration::from_secs(300),
            )
            .await;
        assert_eq!(store.get("realtime_quote:get:code=600519").await, Some(payload));

        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.store_count, Some(1));
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_lazy_expiry_over_backend_ttl() {
        let (store, clock) = store_with_clock();
        store
            .set(
                "ranking:top",
                Bytes::from_static(b"[]"),
                TtlClass::Realtime,
                Duration::from_secs(300),
            )
            .await;
        clock.advance(Duration::from_secs(301));
        // The memory backend still holds it on the real clock.
        assert_eq!(store.get("ranking:top").await, None);
    }

    #[tokio::test]
    async fn test_invalidate_returns_count() {
        let (store, _clock) = store_with_clock();
        for code in ["1", "2", "3"] {
            store
                .set(
                    &format!("kline_daily:get_kline:code={code}"),
                    Bytes::from_static(b"[]"),
                    TtlClass::Daily,
                    Duration::from_secs(60),
                )
                .await;
        }
        assert_eq!(store.invalidate("kline_daily:*").await.unwrap(), 3);
        assert_eq!(store.invalidate("kline_daily:*").await.unwrap(), 0);
        assert!(store.invalidate("").await.is_err());
    }
}
