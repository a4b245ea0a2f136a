//! Response cache.
//!
//! - [`key`]: deterministic cache keys
//! - [`ttl`]: data-type tag to TTL class policy
//! - [`entry`]: cache entry envelope with expiry metadata
//! - [`backend`]: key-value backends (in-process, Redis)
//! - [`store`]: get/set/invalidate with availability-first error handling
//! - [`single_flight`]: per-key stampede protection
//! - [`compressor`]: zstd compression of large payloads

pub mod backend;
pub mod compressor;
pub mod entry;
pub mod key;
pub mod single_flight;
pub mod store;
pub mod ttl;
