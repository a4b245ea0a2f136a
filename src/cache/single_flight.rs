//! Stampede guard: at most one cache fill per key at any instant.
//!
//! The first caller to miss on a key becomes the leader and registers a
//! `watch` channel in the in-flight map; later callers for the same key
//! subscribe to it and receive exactly what the leader produced, success
//! or error. The leader's computation runs on its own task, so a leader
//! whose caller goes away still finishes and fills the cache.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::store::CacheStore;
use crate::cache::ttl::TtlClass;
use crate::metrics::Metrics;

/// The leader ended without publishing a result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("in-flight computation for {key} aborted: {reason}")]
pub struct FlightAborted {
    pub key: String,
    pub reason: String,
}

type Outcome<E> = Option<Result<Bytes, E>>;
type InFlightMap<E> = DashMap<String, watch::Receiver<Outcome<E>>>;

/// Per-key single-flight coordinator.
pub struct StampedeGuard<E> {
    store: Arc<CacheStore>,
    in_flight: Arc<InFlightMap<E>>,
    metrics: Arc<Metrics>,
}

impl<E> StampedeGuard<E>
where
    E: Clone + Send + Sync + From<FlightAborted> + 'static,
{
    pub fn new(store: Arc<CacheStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Run `compute` for `key` unless someone already is, then share the result.
    ///
    /// A successful result is written to the cache before any caller sees
    /// it; a write that fails or panics leaves the result uncached but still
    /// delivered. Failures are handed to every waiter unchanged and never cached.
    pub async fn with_single_flight<F, Fut>(
        &self,
        key: &str,
        ttl_class: TtlClass,
        ttl: Duration,
        compute: F,
    ) -> Result<Bytes, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
    {
        let (mut rx, leader_tx) = match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), None),
            Entry::Vacant(e) => {
                let (tx, rx) = watch::channel(None);
                e.insert(rx.clone());
                (rx, Some(tx))
            }
        };

        match leader_tx {
            Some(tx) => {
                debug!(key, "leading cache fill");
                self.metrics.in_flight.inc();
                let slot = InFlightSlot {
                    key: key.to_string(),
                    map: self.in_flight.clone(),
                    rx: rx.clone(),
                    metrics: self.metrics.clone(),
                };
                let store = self.store.clone();
                let fut = compute();
                tokio::spawn(async move {
                    let slot = slot;
                    let result = match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(key = %slot.key, "cache fill panicked");
                            Err(E::from(FlightAborted {
                                key: slot.key.clone(),
                                reason: "computation panicked".to_string(),
                            }))
                        }
                    };
                    if let Ok(payload) = &result {
                        let fill = store.set(&slot.key, payload.clone(), ttl_class, ttl);
                        if AssertUnwindSafe(fill).catch_unwind().await.is_err() {
                            warn!(key = %slot.key, "cache write panicked, serving uncached");
                        }
                    }
                    let _ = tx.send(Some(result));
                    drop(slot);
                });
            }
            None => {
                self.metrics.coalesced.inc();
                debug!(key, "joining in-flight cache fill");
            }
        }

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(E::from(FlightAborted {
                key: key.to_string(),
                reason: "leader dropped without a result".to_string(),
            }))
        })
    }

    /// Number of keys currently being computed.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }
}

/// Removes the in-flight registration however the leader task ends.
struct InFlightSlot<E> {
    key: String,
    map: Arc<InFlightMap<E>>,
    rx: watch::Receiver<Outcome<E>>,
    metrics: Arc<Metrics>,
}

impl<E> Drop for InFlightSlot<E> {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.key, |_, registered| registered.same_channel(&self.rx));
        self.metrics.in_flight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::cache::backend::{CacheBackend, CacheError, KeyPattern, MemoryBackend};
    use crate::cache::compressor::Compressor;
    use crate::clock::system_clock;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Boom(String),
        Aborted(String),
    }

    impl From<FlightAborted> for TestError {
        fn from(e: FlightAborted) -> Self {
            TestError::Aborted(e.reason)
        }
    }

    fn guard() -> (StampedeGuard<TestError>, Arc<CacheStore>) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(CacheStore::new(
            Arc::new(MemoryBackend::new()),
            system_clock(),
            Compressor::default(),
            metrics.clone(),
        ));
        (StampedeGuard::new(store.clone(), metrics), store)
    }

    #[tokio::test]
    async fn test_leader_stores_result() {
        let (guard, store) = guard();
        let payload = guard
            .with_single_flight("a:b", TtlClass::Realtime, Duration::from_secs(60), || async {
                Ok::<_, TestError>(Bytes::from_static(b"42"))
            })
            .await
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"42"));
        assert_eq!(store.get("a:b").await, Some(Bytes::from_static(b"42")));
        assert_eq!(guard.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let (guard, store) = guard();
        let err = guard
            .with_single_flight("a:b", TtlClass::Realtime, Duration::from_secs(60), || async {
                Err::<Bytes, _>(TestError::Boom("origin down".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, TestError::Boom("origin down".to_string()));
        assert_eq!(store.get("a:b").await, None);
        assert!(!guard.is_in_flight("a:b"));
    }

    #[tokio::test]
    async fn test_panicking_compute_reports_abort() {
        let (guard, _store) = guard();
        let err = guard
            .with_single_flight("p:q", TtlClass::Realtime, Duration::from_secs(60), || async {
                if true {
                    panic!("compute exploded");
                }
                Ok::<Bytes, TestError>(Bytes::new())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TestError::Aborted(_)));
        assert_eq!(guard.in_flight_count(), 0);
    }

    /// Panics on every write.
    struct PanickingBackend;

    #[async_trait::async_trait]
    impl CacheBackend for PanickingBackend {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
            panic!("backend write exploded");
        }

        async fn delete_matching(&self, _pattern: &KeyPattern) -> Result<u64, CacheError> {
            Ok(0)
        }

        async fn len(&self) -> Result<u64, CacheError> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_cache_write_still_delivers() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let store = Arc::new(CacheStore::new(
            Arc::new(PanickingBackend),
            system_clock(),
            Compressor::default(),
            metrics.clone(),
        ));
        let guard = StampedeGuard::<TestError>::new(store, metrics);
        let payload = guard
            .with_single_flight("cal:list", TtlClass::Static, Duration::from_secs(60), || async {
                Ok(Bytes::from_static(b"[1]"))
            })
            .await
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"[1]"));
        assert_eq!(guard.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_ttl_still_delivers() {
        let (guard, store) = guard();
        let payload = guard
            .with_single_flight("cal:list", TtlClass::Static, Duration::MAX, || async {
                Ok::<_, TestError>(Bytes::from_static(b"[1]"))
            })
            .await
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"[1]"));
        assert_eq!(store.stats().await.errors, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_compute() {
        let (guard, _store) = guard();
        let guard = Arc::new(guard);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .with_single_flight("k:line", TtlClass::Intraday, Duration::from_secs(60), || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, TestError>(Bytes::from_static(b"shared"))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Bytes::from_static(b"shared"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
