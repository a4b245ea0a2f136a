//! Backend endpoints and their health bookkeeping.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use crate::clock::Millis;
use crate::config::{EndpointConfig, Location};
use crate::router::store::{BackendError, SharedStore};

/// Health of an endpoint as seen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Up,
    Degraded,
    Down,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Up => write!(f, "up"),
            Health::Degraded => write!(f, "degraded"),
            Health::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, Clone)]
struct HealthRecord {
    health: Health,
    last_probe_at: Option<Millis>,
    consecutive_failures: u32,
    last_error: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            health: Health::Up,
            last_probe_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Point-in-time view of an endpoint, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub location: Location,
    pub priority: i32,
    pub health: Health,
    pub last_probe_at: Option<Millis>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// One configured backing store.
pub struct Endpoint {
    config: EndpointConfig,
    store: SharedStore,
    record: Arc<RwLock<HealthRecord>>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, store: SharedStore) -> Self {
        Self {
            config,
            store,
            record: Arc::new(RwLock::new(HealthRecord::default())),
        }
    }

    /// Same store and health history under new settings (priority, location).
    pub(crate) fn with_config(&self, config: EndpointConfig) -> Self {
        Self {
            config,
            store: self.store.clone(),
            record: self.record.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn health(&self) -> Health {
        self.record.read().await.health
    }

    pub async fn record_success(&self) {
        let mut record = self.record.write().await;
        record.health = Health::Up;
        record.consecutive_failures = 0;
        record.last_error = None;
    }

    /// Degraded on the first failure, down once `threshold` failures run
    /// back to back. A refused connection is down straight away.
    pub async fn record_failure(&self, error: &BackendError, threshold: u32) -> Health {
        let mut record = self.record.write().await;
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.last_error = Some(error.to_string());
        record.health = if matches!(error, BackendError::Unavailable(_))
            || record.consecutive_failures >= threshold
        {
            Health::Down
        } else {
            Health::Degraded
        };
        record.health
    }

    /// Result of a background probe. A successful probe always restores `Up`.
    pub async fn record_probe(&self, at: Millis, outcome: Result<(), BackendError>) -> Health {
        let mut record = self.record.write().await;
        record.last_probe_at = Some(at);
        match outcome {
            Ok(()) => {
                record.health = Health::Up;
                record.consecutive_failures = 0;
                record.last_error = None;
            }
            Err(e) => {
                record.health = Health::Down;
                record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                record.last_error = Some(e.to_string());
            }
        }
        record.health
    }

    /// Force a health state (operator override, tests).
    pub async fn set_health(&self, health: Health) {
        self.record.write().await.health = health;
    }

    pub async fn status(&self) -> EndpointStatus {
        let record = self.record.read().await;
        EndpointStatus {
            name: self.config.name.clone(),
            location: self.config.location,
            priority: self.config.priority,
            health: record.health,
            last_probe_at: record.last_probe_at,
            consecutive_failures: record.consecutive_failures,
            last_error: record.last_error.clone(),
        }
    }
}
