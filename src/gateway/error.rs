use std::time::Duration;

use thiserror::Error;

use crate::cache::backend::CacheError;
use crate::cache::single_flight::FlightAborted;
use crate::config::ConfigError;
use crate::ratelimit::Tier;
use crate::router::{BackendError, OriginError};

/// Failure of a caller-supplied compute function.
///
/// Shared verbatim with every caller waiting on the same key, hence `Clone`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Aborted(#[from] FlightAborted),
}

impl ComputeError {
    pub fn failed(message: impl Into<String>) -> Self {
        ComputeError::Failed(message.into())
    }
}

/// Outcome of `serve` that the caller has to react to.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServeError {
    #[error("rate limit exceeded for {subject} ({tier}); retry after {retry_after:?}")]
    AdmissionRejected {
        subject: String,
        tier: Tier,
        retry_after: Duration,
    },

    #[error("no origin endpoint available (tried: [{}], down: [{}])", tried.join(", "), down.join(", "))]
    OriginUnavailable { tried: Vec<String>, down: Vec<String> },

    #[error("compute failed: {0}")]
    ComputeFailed(String),
}

impl From<ComputeError> for ServeError {
    fn from(err: ComputeError) -> Self {
        match err {
            ComputeError::Origin(OriginError::Unavailable { tried, down }) => {
                ServeError::OriginUnavailable { tried, down }
            }
            other => ServeError::ComputeFailed(other.to_string()),
        }
    }
}

/// Startup and reload failures.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("cache backend: {0}")]
    Cache(#[from] CacheError),

    #[error("database endpoint: {0}")]
    Backend(#[from] BackendError),

    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}
