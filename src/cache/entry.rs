//! Cache entry and its binary envelope.
//!
//! Every value written to a backend carries its own creation and expiry
//! timestamps, so a read can reject an entry the backend has not purged
//! yet.
//!
//! ```text
//! +---------+-------+-----------+------------+------------+---------+
//! | version | flags | ttl_class | created_at | expires_at | payload |
//! |   u8    |  u8   |    u8     |  u64 (BE)  |  u64 (BE)  |  bytes  |
//! +---------+-------+-----------+------------+------------+---------+
//! ```

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cache::backend::CacheError;
use crate::cache::ttl::TtlClass;
use crate::clock::Millis;

const ENVELOPE_VERSION: u8 = 1;
const HEADER_LEN: usize = 3 + 8 + 8;
const FLAG_ZSTD: u8 = 0b0000_0001;

/// A cached payload with its freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    /// Stored bytes (zstd-compressed when `compressed` is set).
    pub payload: Bytes,
    pub compressed: bool,
    pub ttl_class: TtlClass,
    pub created_at: Millis,
    pub expires_at: Millis,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        payload: Bytes,
        compressed: bool,
        ttl_class: TtlClass,
        created_at: Millis,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            compressed,
            ttl_class,
            created_at,
            expires_at: created_at
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// An entry is served up to and including `expires_at`.
    pub fn is_expired(&self, now: Millis) -> bool {
        now > self.expires_at
    }

    /// Time left before expiry, for the backend-native TTL.
    pub fn remaining(&self, now: Millis) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(if self.compressed { FLAG_ZSTD } else { 0 });
        buf.put_u8(self.ttl_class.to_byte());
        buf.put_u64(self.created_at);
        buf.put_u64(self.expires_at);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(key: &str, mut raw: Bytes) -> Result<Self, CacheError> {
        if raw.len() < HEADER_LEN {
            return Err(CacheError::Corrupt(format!(
                "entry {key} is {} bytes, shorter than the header",
                raw.len()
            )));
        }
        let version = raw.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(CacheError::Corrupt(format!(
                "entry {key} has unknown envelope version {version}"
            )));
        }
        let flags = raw.get_u8();
        let class_byte = raw.get_u8();
        let ttl_class = TtlClass::from_byte(class_byte).ok_or_else(|| {
            CacheError::Corrupt(format!("entry {key} has unknown ttl class {class_byte}"))
        })?;
        let created_at = raw.get_u64();
        let expires_at = raw.get_u64();

        Ok(Self {
            key: key.to_string(),
            payload: raw,
            compressed: flags & FLAG_ZSTD != 0,
            ttl_class,
            created_at,
            expires_at,
        })
    }
}
