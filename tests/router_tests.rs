//! Integration tests for endpoint failover, batch fan-out and health probing.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use market_cache_gateway::clock::system_clock;
use market_cache_gateway::config::{EndpointConfig, Location, PriorityMode};
use market_cache_gateway::metrics::Metrics;
use market_cache_gateway::router::{
    BackendError, ConnectionRouter, DocumentQuery, DocumentStore, Endpoint, Health, HttpStore,
    MemoryStore, OriginError, RouterSettings,
};

/// Refuses every query until switched back on.
#[derive(Default)]
struct SwitchableStore {
    offline: AtomicBool,
    queries: AtomicUsize,
}

#[async_trait]
impl DocumentStore for SwitchableStore {
    async fn find(&self, query: &DocumentQuery) -> Result<Vec<Value>, BackendError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("connection refused".to_string()));
        }
        Ok(vec![json!({ "collection": query.collection })])
    }

    async fn ping(&self) -> Result<(), BackendError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BackendError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Hangs on one collection, answers the rest.
struct StallingStore {
    stall_on: &'static str,
}

#[async_trait]
impl DocumentStore for StallingStore {
    async fn find(&self, query: &DocumentQuery) -> Result<Vec<Value>, BackendError> {
        if query.collection == self.stall_on {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(vec![json!({ "collection": query.collection })])
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

fn endpoint(name: &str, location: Location, priority: i32, store: Arc<dyn DocumentStore>) -> Endpoint {
    Endpoint::new(
        EndpointConfig {
            name: name.to_string(),
            address: format!("memory://{name}"),
            priority,
            location,
        },
        store,
    )
}

fn router(endpoints: Vec<Endpoint>, query_timeout: Duration) -> ConnectionRouter {
    let settings = RouterSettings {
        priority_mode: PriorityMode::LocalFirst,
        query_timeout,
        probe_timeout: Duration::from_millis(200),
        failure_threshold: 3,
        batch_concurrency: 8,
    };
    ConnectionRouter::new(
        endpoints,
        settings,
        system_clock(),
        Arc::new(Metrics::new().unwrap()),
    )
}

#[tokio::test]
async fn test_fails_over_to_next_endpoint() {
    let local = Arc::new(SwitchableStore::default());
    local.offline.store(true, Ordering::SeqCst);
    let cloud = Arc::new(SwitchableStore::default());
    let router = router(
        vec![
            endpoint("cloud", Location::Cloud, 0, cloud.clone()),
            endpoint("local", Location::Local, 0, local.clone()),
        ],
        Duration::from_secs(1),
    );

    let docs = router
        .execute(&DocumentQuery::new("stock_basic"))
        .await
        .unwrap();
    assert_eq!(docs, vec![json!({ "collection": "stock_basic" })]);
    assert_eq!(router.endpoint("local").unwrap().health().await, Health::Down);

    // The down endpoint is skipped without being asked again.
    router.execute(&DocumentQuery::new("stock_basic")).await.unwrap();
    assert_eq!(local.queries.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.queries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_all_down_fails_fast() {
    let router = router(
        vec![
            endpoint("local", Location::Local, 0, Arc::new(MemoryStore::new())),
            endpoint("cloud", Location::Cloud, 0, Arc::new(MemoryStore::new())),
        ],
        Duration::from_secs(5),
    );
    for ep in router.endpoints().iter() {
        ep.set_health(Health::Down).await;
    }

    let started = Instant::now();
    let err = router
        .execute(&DocumentQuery::new("kline_daily"))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(
        err,
        OriginError::Unavailable {
            tried: vec![],
            down: vec!["local".to_string(), "cloud".to_string()],
        }
    );
}

#[tokio::test]
async fn test_hanging_endpoints_bounded_by_timeout() {
    let timeout = Duration::from_millis(50);
    let router = router(
        vec![
            endpoint("local", Location::Local, 0, Arc::new(StallingStore { stall_on: "q" })),
            endpoint("cloud", Location::Cloud, 0, Arc::new(StallingStore { stall_on: "q" })),
        ],
        timeout,
    );

    let started = Instant::now();
    let err = router.execute(&DocumentQuery::new("q")).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        OriginError::Unavailable { tried, down } => {
            assert_eq!(tried, ["local", "cloud"]);
            assert!(down.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    // One timeout degrades; it takes `failure_threshold` to go down.
    assert_eq!(router.endpoint("local").unwrap().health().await, Health::Degraded);
}

#[tokio::test]
async fn test_batch_isolates_failing_query() {
    let router = router(
        vec![endpoint(
            "local",
            Location::Local,
            0,
            Arc::new(StallingStore { stall_on: "q3" }),
        )],
        Duration::from_millis(100),
    );

    let queries = (1..=5).map(|i| DocumentQuery::new(format!("q{i}"))).collect();
    let started = Instant::now();
    let results = router.execute_batch(queries).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(results.len(), 5);
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
    assert_eq!(
        results[2],
        Err(OriginError::Failed {
            endpoint: "local".to_string(),
            error: BackendError::Timeout(Duration::from_millis(100)),
        })
    );
    assert_eq!(results[4], Ok(vec![json!({ "collection": "q5" })]));
}

#[tokio::test]
async fn test_batch_with_no_healthy_endpoint() {
    let router = router(
        vec![endpoint("local", Location::Local, 0, Arc::new(MemoryStore::new()))],
        Duration::from_secs(1),
    );
    router.endpoint("local").unwrap().set_health(Health::Down).await;

    let results = router
        .execute_batch(vec![DocumentQuery::new("a"), DocumentQuery::new("b")])
        .await;
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(OriginError::Unavailable { .. }))));
}

#[tokio::test]
async fn test_probe_recovers_endpoint() {
    let local = Arc::new(SwitchableStore::default());
    local.offline.store(true, Ordering::SeqCst);
    let router = router(
        vec![endpoint("local", Location::Local, 0, local.clone())],
        Duration::from_secs(1),
    );

    assert!(router.execute(&DocumentQuery::new("x")).await.is_err());
    assert_eq!(router.endpoint("local").unwrap().health().await, Health::Down);

    router.probe_all().await;
    assert_eq!(router.endpoint("local").unwrap().health().await, Health::Down);

    local.offline.store(false, Ordering::SeqCst);
    router.probe_all().await;
    let status = router.status().await;
    assert_eq!(status[0].health, Health::Up);
    assert!(status[0].last_probe_at.is_some());
    assert!(router.execute(&DocumentQuery::new("x")).await.is_ok());
}

/// Serve a seeded memory store as a remote document service.
async fn document_service(store: Arc<MemoryStore>) -> String {
    async fn find(
        State(store): State<Arc<MemoryStore>>,
        Json(query): Json<DocumentQuery>,
    ) -> Result<Json<Vec<Value>>, (StatusCode, String)> {
        store
            .find(&query)
            .await
            .map(Json)
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
    }

    let app = Router::new()
        .route("/find", post(find))
        .route("/health", get(|| async { "ok" }))
        .with_state(store);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// An address nothing listens on.
async fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

#[tokio::test]
async fn test_http_endpoints_fail_over() {
    let seeded = MemoryStore::new();
    seeded
        .insert("trade_calendar", vec![json!({"date": "2024-01-02", "open": true})])
        .await;
    let live = document_service(Arc::new(seeded)).await;
    let dead = refused_address().await;

    let router = router(
        vec![
            endpoint("local", Location::Local, 0, Arc::new(HttpStore::new(dead))),
            endpoint("cloud", Location::Cloud, 0, Arc::new(HttpStore::new(live))),
        ],
        Duration::from_secs(2),
    );

    let docs = router
        .execute(&DocumentQuery::new("trade_calendar").filter("open", "true"))
        .await
        .unwrap();
    assert_eq!(docs, vec![json!({"date": "2024-01-02", "open": true})]);
    assert_eq!(router.endpoint("local").unwrap().health().await, Health::Down);

    router.probe_all().await;
    let status = router.status().await;
    assert_eq!(status.iter().find(|s| s.name == "cloud").unwrap().health, Health::Up);
    assert_eq!(status.iter().find(|s| s.name == "local").unwrap().health, Health::Down);

    // A query the service refuses is the caller's problem, not the endpoint's.
    let err = router.execute(&DocumentQuery::new("")).await.unwrap_err();
    assert!(matches!(err, OriginError::Rejected { .. }));
    assert_eq!(router.endpoint("cloud").unwrap().health().await, Health::Up);
}
