//! market-cache-gateway: cache-aside middle tier for market-data queries.
//!
//! Sits between route handlers and the backing document stores:
//!   admission (token bucket + sliding window) → response cache → single-flight
//!   compute → ordered failover across local/cloud endpoints
//!
//! Exposes an operator HTTP surface for cache and endpoint management.

pub mod cache;
pub mod clock;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod ratelimit;
pub mod router;
pub mod server;
