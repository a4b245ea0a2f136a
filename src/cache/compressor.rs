//! Payload compression for cache entries.
//!
//! Large JSON payloads (full symbol lists, multi-year K-lines) are zstd
//! compressed before they reach the backend; small ones are stored as-is.

use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),
}

/// Compression settings.
#[derive(Debug, Clone, Copy)]
pub struct CompressionSettings {
    /// Payloads at least this large are compressed (0 disables compression).
    pub threshold: usize,
    /// zstd compression level (1-22).
    pub level: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            threshold: 8 * 1024,
            level: 3,
        }
    }
}

/// Compresses and restores payload bytes.
#[derive(Debug, Clone)]
pub struct Compressor {
    settings: CompressionSettings,
}

impl Compressor {
    pub fn new(settings: CompressionSettings) -> Self {
        Self { settings }
    }

    /// Returns the bytes to store and whether they were compressed.
    pub fn pack(&self, payload: &Bytes) -> Result<(Bytes, bool), CompressionError> {
        if self.settings.threshold == 0 || payload.len() < self.settings.threshold {
            return Ok((payload.clone(), false));
        }
        let compressed = zstd::encode_all(payload.as_ref(), self.settings.level)?;
        // Incompressible payloads are kept raw.
        if compressed.len() >= payload.len() {
            return Ok((payload.clone(), false));
        }
        Ok((Bytes::from(compressed), true))
    }

    /// Reverse of [`Compressor::pack`].
    pub fn unpack(&self, data: Bytes, compressed: bool) -> Result<Bytes, CompressionError> {
        if !compressed {
            return Ok(data);
        }
        Ok(Bytes::from(zstd::decode_all(data.as_ref())?))
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_untouched() {
        let compressor = Compressor::default();
        let payload = Bytes::from_static(b"{\"price\": 10.5}");
        let (stored, compressed) = compressor.pack(&payload).unwrap();
        assert!(!compressed);
        assert_eq!(stored, payload);
    }

    #[test]
    fn test_large_payload_compressed() {
        let compressor = Compressor::new(CompressionSettings {
            threshold: 1024,
            level: 3,
        });
        let row = "{\"code\":\"600519\",\"name\":\"Kweichow Moutai\",\"market\":\"main\"},";
        let payload = Bytes::from(format!("[{}]", row.repeat(200)));
        let (stored, compressed) = compressor.pack(&payload).unwrap();
        assert!(compressed);
        assert!(stored.len() < payload.len());
        assert_eq!(compressor.unpack(stored, true).unwrap(), payload);
    }
}
