//! Key-value backends for the response cache.
//!
//! - [`MemoryBackend`]: in-process `DashMap` with native TTL
//! - `RedisBackend` (feature `redis`): shared across gateway instances

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("invalid key pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("ttl of {0:?} is out of range")]
    TtlOutOfRange(Duration),
}

/// A glob over cache keys.
///
/// `*` matches any run of characters and `?` a single one. A pattern with
/// no wildcard matches every key it prefixes.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    glob: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self, CacheError> {
        if pattern.is_empty() {
            return Err(CacheError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".to_string(),
            });
        }
        let has_wildcard = pattern.contains(['*', '?']);

        let mut regex = String::from("^");
        let mut glob = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' => {
                    regex.push_str(".*");
                    glob.push('*');
                }
                '?' => {
                    regex.push('.');
                    glob.push('?');
                }
                '[' | ']' | '\\' => {
                    regex.push_str(&regex::escape(&ch.to_string()));
                    glob.push('\\');
                    glob.push(ch);
                }
                _ => {
                    regex.push_str(&regex::escape(&ch.to_string()));
                    glob.push(ch);
                }
            }
        }
        if !has_wildcard {
            regex.push_str(".*");
            glob.push('*');
        }
        regex.push('$');

        let regex = Regex::new(&regex).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            glob,
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Redis-compatible glob form.
    pub fn as_glob(&self) -> &str {
        &self.glob
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// A shared key-value store with native expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Delete every key matching `pattern`; returns how many were removed.
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, CacheError>;

    /// Number of live keys.
    async fn len(&self) -> Result<u64, CacheError>;

    /// Drop physically expired entries, if the backend needs help with that.
    async fn purge_expired(&self) -> Result<u64, CacheError> {
        Ok(0)
    }

    fn name(&self) -> &'static str;
}

pub type SharedBackend = Arc<dyn CacheBackend>;

#[derive(Debug, Clone)]
struct MemorySlot {
    value: Bytes,
    expires: Instant,
}

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: DashMap<String, MemorySlot>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let now = Instant::now();
        let hit = self
            .map
            .get(key)
            .filter(|slot| slot.expires > now)
            .map(|slot| slot.value.clone());
        if hit.is_none() {
            self.map.remove_if(key, |_, slot| slot.expires <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let expires = Instant::now()
            .checked_add(ttl)
            .ok_or(CacheError::TtlOutOfRange(ttl))?;
        self.map
            .insert(key.to_string(), MemorySlot { value, expires });
        Ok(())
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, CacheError> {
        let victims: Vec<String> = self
            .map
            .iter()
            .filter(|e| pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        let mut deleted = 0;
        for key in victims {
            if self.map.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn len(&self) -> Result<u64, CacheError> {
        let now = Instant::now();
        Ok(self.map.iter().filter(|e| e.expires > now).count() as u64)
    }

    async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, slot| slot.expires > now);
        Ok(before.saturating_sub(self.map.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;

    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::info;

    const SCAN_BATCH: usize = 500;

    /// Redis-backed cache shared by every gateway instance.
    pub struct RedisBackend {
        conn: ConnectionManager,
        key_prefix: String,
    }

    impl RedisBackend {
        pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, CacheError> {
            let client =
                redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            info!(url, key_prefix, "Redis cache backend connected");
            Ok(Self {
                conn,
                key_prefix: key_prefix.to_string(),
            })
        }

        fn full_key(&self, key: &str) -> String {
            format!("{}{}", self.key_prefix, key)
        }

        async fn scan(&self, glob: &str) -> Result<Vec<String>, CacheError> {
            let mut conn = self.conn.clone();
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(glob)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }
            Ok(keys)
        }
    }

    fn unavailable(e: redis::RedisError) -> CacheError {
        CacheError::Unavailable(e.to_string())
    }

    #[async_trait]
    impl CacheBackend for RedisBackend {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
            let mut conn = self.conn.clone();
            let data: Option<Vec<u8>> = conn.get(self.full_key(key)).await.map_err(unavailable)?;
            Ok(data.map(Bytes::from))
        }

        async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
            let mut conn = self.conn.clone();
            let secs = ttl.as_secs().max(1);
            conn.set_ex::<_, _, ()>(self.full_key(key), value.as_ref(), secs)
                .await
                .map_err(unavailable)
        }

        async fn delete_matching(&self, pattern: &KeyPattern) -> Result<u64, CacheError> {
            let glob = format!("{}{}", self.key_prefix, pattern.as_glob());
            let keys = self.scan(&glob).await?;
            if keys.is_empty() {
                return Ok(0);
            }
            let mut conn = self.conn.clone();
            let mut deleted = 0;
            for chunk in keys.chunks(SCAN_BATCH) {
                let n: u64 = conn.del(chunk).await.map_err(unavailable)?;
                deleted += n;
            }
            Ok(deleted)
        }

        async fn len(&self) -> Result<u64, CacheError> {
            let glob = format!("{}*", self.key_prefix);
            Ok(self.scan(&glob).await?.len() as u64)
        }

        fn name(&self) -> &'static str {
            "redis"
        }
    }
}
