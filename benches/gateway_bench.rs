//! Benchmarks for the request hot path.

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use market_cache_gateway::cache::compressor::Compressor;
use market_cache_gateway::cache::key::{KeyCodec, Params};
use market_cache_gateway::clock::system_clock;
use market_cache_gateway::metrics::Metrics;
use market_cache_gateway::ratelimit::{LimiterPolicy, RateLimiter, Tier};

fn bench_key_encode(c: &mut Criterion) {
    let codec = KeyCodec::default();
    let mut params = Params::new();
    params.insert("code".to_string(), json!("600519"));
    params.insert("period".to_string(), json!("daily"));
    params.insert("start".to_string(), json!("2024-01-01"));
    params.insert("adjust".to_string(), json!("qfq"));

    c.bench_function("key_encode_4_params", |b| {
        b.iter(|| {
            let key = codec
                .encode("kline_daily", "get_kline", black_box(&params))
                .unwrap();
            black_box(key);
        });
    });
}

fn bench_admit(c: &mut Criterion) {
    let limiter = RateLimiter::new(
        LimiterPolicy::default(),
        system_clock(),
        Arc::new(Metrics::new().unwrap()),
    );
    let subjects: Vec<String> = (0..1_000).map(|i| format!("user-{i}")).collect();
    let mut i = 0;

    c.bench_function("admit_1k_subjects", |b| {
        b.iter(|| {
            i = (i + 1) % subjects.len();
            black_box(limiter.admit(&subjects[i], Tier::Enterprise));
        });
    });
}

fn bench_compression(c: &mut Criterion) {
    let compressor = Compressor::default();
    let rows: Vec<_> = (0..2_000)
        .map(|i| json!({"code": format!("{i:06}"), "open": 10.1, "close": 10.5, "volume": 120_000}))
        .collect();
    let payload = Bytes::from(serde_json::to_vec(&rows).unwrap());

    c.bench_function("pack_kline_2k_rows", |b| {
        b.iter(|| {
            let packed = compressor.pack(black_box(&payload)).unwrap();
            black_box(packed);
        });
    });
}

criterion_group!(benches, bench_key_encode, bench_admit, bench_compression);
criterion_main!(benches);
