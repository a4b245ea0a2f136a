//! Integration tests for the response cache and the stampede guard.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use market_cache_gateway::cache::backend::{CacheBackend, CacheError, KeyPattern, MemoryBackend};
use market_cache_gateway::cache::compressor::{CompressionSettings, Compressor};
use market_cache_gateway::cache::key::{KeyCodec, Params};
use market_cache_gateway::cache::store::CacheStore;
use market_cache_gateway::cache::ttl::{TtlClass, TtlPolicy};
use market_cache_gateway::clock::ManualClock;
use market_cache_gateway::config::Config;
use market_cache_gateway::gateway::{ComputeError, Gateway, GatewayError, ServeError, Source};
use market_cache_gateway::metrics::Metrics;
use market_cache_gateway::ratelimit::Tier;
use market_cache_gateway::router::{ConnectionRouter, Endpoint, MemoryStore, RouterSettings};

const T0: u64 = 1_700_000_000_000;

/// A cache that is never reachable.
struct UnreachableBackend;

#[async_trait]
impl CacheBackend for UnreachableBackend {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn delete_matching(&self, _pattern: &KeyPattern) -> Result<u64, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    async fn len(&self) -> Result<u64, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

fn gateway_with(backend: Arc<dyn CacheBackend>, clock: Arc<ManualClock>) -> Gateway {
    let config = Config::default();
    let endpoints = config
        .database
        .endpoints
        .iter()
        .map(|cfg| Endpoint::new(cfg.clone(), Arc::new(MemoryStore::new())))
        .collect();
    let router = ConnectionRouter::new(
        endpoints,
        RouterSettings::from(&config.database),
        clock.clone(),
        Arc::new(Metrics::new().unwrap()),
    );
    Gateway::from_parts(&config, backend, router, clock).unwrap()
}

fn market_params() -> Params {
    let mut params = Params::new();
    params.insert("market".to_string(), json!("主板"));
    params
}

#[tokio::test]
async fn test_daily_entry_expires_after_one_day() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::new(
        Arc::new(MemoryBackend::new()),
        clock.clone(),
        Compressor::default(),
        Arc::new(Metrics::new().unwrap()),
    );
    let key = KeyCodec::default()
        .encode("stock_basic", "get_stock_list", &market_params())
        .unwrap();
    assert_eq!(key.as_str(), "stock_basic:get_stock_list:market=主板");

    let policy = TtlPolicy::default();
    assert_eq!(policy.class_for("stock_basic"), TtlClass::Daily);
    let ttl = policy.ttl_for("stock_basic");
    assert_eq!(ttl, Duration::from_secs(86_400));

    assert!(store.get(key.as_str()).await.is_none());
    let payload = Bytes::from_static(br#"[{"code":"600519"}]"#);
    store.set(key.as_str(), payload.clone(), TtlClass::Daily, ttl).await;

    clock.advance(Duration::from_secs(86_399));
    assert_eq!(store.get(key.as_str()).await, Some(payload));

    clock.advance(Duration::from_secs(2));
    assert!(store.get(key.as_str()).await.is_none());

    let stats = store.stats().await;
    assert_eq!((stats.hits, stats.misses, stats.writes), (1, 2, 1));
}

#[tokio::test]
async fn test_large_payload_roundtrips_compressed() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::new(
        Arc::new(MemoryBackend::new()),
        clock,
        Compressor::new(CompressionSettings {
            threshold: 1024,
            level: 3,
        }),
        Arc::new(Metrics::new().unwrap()),
    );
    let rows: Vec<_> = (0..500)
        .map(|i| json!({"code": format!("{i:06}"), "close": 10.5}))
        .collect();
    let payload = Bytes::from(serde_json::to_vec(&rows).unwrap());
    store
        .set("kline_daily:get:k", payload.clone(), TtlClass::Daily, Duration::from_secs(60))
        .await;
    assert_eq!(store.get("kline_daily:get:k").await, Some(payload));
}

#[tokio::test]
async fn test_invalidate_by_pattern() {
    let clock = Arc::new(ManualClock::new(T0));
    let store = CacheStore::new(
        Arc::new(MemoryBackend::new()),
        clock,
        Compressor::default(),
        Arc::new(Metrics::new().unwrap()),
    );
    let ttl = Duration::from_secs(300);
    for key in [
        "realtime_quote:get:code=600519",
        "realtime_quote:get:code=000001",
        "stock_basic:get_stock_list",
    ] {
        store
            .set(key, Bytes::from_static(b"{}"), TtlClass::Realtime, ttl)
            .await;
    }

    assert_eq!(store.invalidate("realtime_quote:*").await.unwrap(), 2);
    assert!(store.get("stock_basic:get_stock_list").await.is_some());
    assert_eq!(store.invalidate("*").await.unwrap(), 1);
    assert_eq!(store.stats().await.store_count, Some(0));
}

#[tokio::test]
async fn test_concurrent_misses_compute_once() {
    let gateway = Arc::new(gateway_with(
        Arc::new(MemoryBackend::new()),
        Arc::new(ManualClock::new(T0)),
    ));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..32 {
        let gateway = gateway.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .serve(
                    &format!("user-{i}"),
                    Tier::Enterprise,
                    "ranking",
                    "top_gainers",
                    &Params::new(),
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(json!({"top": ["600519", "300750"]}))
                    },
                )
                .await
        }));
    }

    let mut payloads = Vec::new();
    for h in handles {
        payloads.push(h.await.unwrap().unwrap().payload);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(payloads.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(gateway.in_flight(), 0);

    let again = gateway
        .serve("late", Tier::Enterprise, "ranking", "top_gainers", &Params::new(), |_| async {
            Ok(json!("unused"))
        })
        .await
        .unwrap();
    assert_eq!(again.source, Source::Cache);
}

#[tokio::test]
async fn test_concurrent_failure_shared_and_not_cached() {
    let gateway = Arc::new(gateway_with(
        Arc::new(MemoryBackend::new()),
        Arc::new(ManualClock::new(T0)),
    ));
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gateway = gateway.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .serve("k", Tier::Enterprise, "financial", "income", &Params::new(), move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err(ComputeError::failed("report not published"))
                })
                .await
        }));
    }
    for h in handles {
        assert_eq!(
            h.await.unwrap().unwrap_err(),
            ServeError::ComputeFailed("report not published".to_string())
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.cache_stats().await.writes, 0);
}

#[tokio::test]
async fn test_unreachable_cache_falls_through_to_compute() {
    let gateway = gateway_with(Arc::new(UnreachableBackend), Arc::new(ManualClock::new(T0)));
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let calls = calls.clone();
        let served = gateway
            .serve("k", Tier::Premium, "stock_basic", "get_stock_list", &market_params(), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!([{"code": "600519", "market": "主板"}]))
            })
            .await
            .unwrap();
        assert_eq!(served.source, Source::Origin);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&served.payload).unwrap(),
            json!([{"code": "600519", "market": "主板"}])
        );
    }

    // Always recompute; every get and set fault is counted, none surfaced.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let stats = gateway.cache_stats().await;
    assert_eq!(stats.errors, 6);
    assert_eq!(stats.store_count, None);
    assert!(gateway.clear("*").await.is_err());
}

#[tokio::test]
async fn test_leader_finishes_after_caller_drops() {
    let gateway = Arc::new(gateway_with(
        Arc::new(MemoryBackend::new()),
        Arc::new(ManualClock::new(T0)),
    ));

    let leader = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .serve("k", Tier::Enterprise, "market_overview", "summary", &Params::new(), |_| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({"index": 3050.2}))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader.abort();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let served = gateway
        .serve("k", Tier::Enterprise, "market_overview", "summary", &Params::new(), |_| async {
            Ok(json!("recomputed"))
        })
        .await
        .unwrap();
    assert_eq!(served.source, Source::Cache);
    assert_eq!(&served.payload[..], br#"{"index":3050.2}"#);
}

#[tokio::test]
async fn test_unbounded_ttl_class_refused_at_startup() {
    let mut config = Config::default();
    config.cache.ttl_classes.static_data = u64::MAX;
    let endpoints = config
        .database
        .endpoints
        .iter()
        .map(|cfg| Endpoint::new(cfg.clone(), Arc::new(MemoryStore::new())))
        .collect();
    let clock = Arc::new(ManualClock::new(T0));
    let router = ConnectionRouter::new(
        endpoints,
        RouterSettings::from(&config.database),
        clock.clone(),
        Arc::new(Metrics::new().unwrap()),
    );
    let result = Gateway::from_parts(&config, Arc::new(MemoryBackend::new()), router, clock);
    assert!(matches!(result, Err(GatewayError::Config(_))));
}

#[tokio::test]
async fn test_static_class_served_and_cached() {
    let gateway = gateway_with(Arc::new(MemoryBackend::new()), Arc::new(ManualClock::new(T0)));
    for expected in [Source::Origin, Source::Cache] {
        let served = gateway
            .serve("k", Tier::Enterprise, "trade_calendar", "list", &Params::new(), |_| async {
                Ok(json!([1]))
            })
            .await
            .unwrap();
        assert_eq!(served.source, expected);
        assert_eq!(&served.payload[..], b"[1]");
    }
}
