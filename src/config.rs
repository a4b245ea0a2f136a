//! Runtime configuration for market-cache-gateway.
//!
//! Configuration is loaded from a JSON file; every section has defaults so a
//! partial file works. `Config::validate` rejects malformed tier tables and
//! endpoint lists before the gateway serves any traffic.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::ttl::{TtlClass, TtlClasses};
use crate::ratelimit::tier::{default_tier_table, Tier, TierLimits};
use crate::router::store::is_supported_address;

/// Longest TTL any class may carry: ten years.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "market-cache-gateway", about = "Cache-aside gateway for market-data queries")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("tier {0} is missing from the tier table")]
    MissingTier(Tier),

    #[error("tier {tier}: {reason}")]
    InvalidTier { tier: Tier, reason: &'static str },

    #[error("no database endpoints configured")]
    NoEndpoints,

    #[error("duplicate endpoint name {0:?}")]
    DuplicateEndpoint(String),

    #[error("endpoint {name:?}: {reason}")]
    InvalidEndpoint { name: String, reason: String },

    #[error("ttl class {0} must be between one second and ten years")]
    InvalidTtl(TtlClass),

    #[error("{field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Admission control settings.
    pub rate_limit: RateLimitConfig,

    /// Backing store endpoints and failover settings.
    pub database: DatabaseConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Which key-value store backs the response cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CacheBackendConfig {
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

fn default_key_prefix() -> String {
    "mcg:".to_string()
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendConfig,

    /// Seconds per TTL class.
    pub ttl_classes: TtlClasses,

    /// Per data-type TTL class overrides.
    pub data_types: HashMap<String, TtlClass>,

    /// Parameter defaults per `data_type:endpoint` route, dropped from cache keys.
    pub param_defaults: HashMap<String, BTreeMap<String, Value>>,

    /// Parameter strings longer than this are replaced by a digest.
    pub max_param_len: usize,

    /// Payloads at least this many bytes are zstd-compressed (0 = never).
    pub compress_threshold: usize,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Interval between expired-entry sweeps, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendConfig::default(),
            ttl_classes: TtlClasses::default(),
            data_types: HashMap::new(),
            param_defaults: HashMap::new(),
            max_param_len: 128,
            compress_threshold: 8 * 1024,
            zstd_level: 3,
            sweep_interval_secs: 60,
        }
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Quotas per tier.
    pub tiers: BTreeMap<Tier, TierLimits>,

    /// Known subjects (API keys, user ids) and their tier.
    pub subjects: HashMap<String, Tier>,

    /// Subjects idle for this long are forgotten.
    pub idle_eviction_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: default_tier_table(),
            subjects: HashMap::new(),
            idle_eviction_secs: 2 * 3_600,
        }
    }
}

/// Where an endpoint lives, for priority ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Local,
    Cloud,
}

/// Which location is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    #[default]
    LocalFirst,
    CloudFirst,
}

impl PriorityMode {
    pub fn preferred(&self) -> Location {
        match self {
            PriorityMode::LocalFirst => Location::Local,
            PriorityMode::CloudFirst => Location::Cloud,
        }
    }
}

/// One backing document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,

    /// `memory://<label>`, `file://<path to JSON collections>` or
    /// `http(s)://<document service base URL>`.
    pub address: String,

    /// Lower values are tried first within the same location.
    #[serde(default)]
    pub priority: i32,

    pub location: Location,
}

/// Backing store endpoints and failover settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub endpoints: Vec<EndpointConfig>,

    pub priority_mode: PriorityMode,

    /// Per-endpoint, per-query timeout.
    pub query_timeout_ms: u64,

    /// Health probe period.
    pub probe_interval_secs: u64,

    /// Health probe timeout.
    pub probe_timeout_ms: u64,

    /// Consecutive failures before an endpoint is marked down.
    pub failure_threshold: u32,

    /// Maximum concurrent queries within one batch.
    pub batch_concurrency: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                EndpointConfig {
                    name: "local".to_string(),
                    address: "memory://local".to_string(),
                    priority: 0,
                    location: Location::Local,
                },
                EndpointConfig {
                    name: "cloud".to_string(),
                    address: "memory://cloud".to_string(),
                    priority: 0,
                    location: Location::Cloud,
                },
            ],
            priority_mode: PriorityMode::LocalFirst,
            query_timeout_ms: 5_000,
            probe_interval_secs: 10,
            probe_timeout_ms: 1_000,
            failure_threshold: 3,
            batch_concurrency: 16,
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when it is absent.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }
        Self::load_existing(path)
    }

    /// Load configuration from a JSON file that must exist. Used on reload,
    /// where silently falling back to defaults would replace a running config.
    pub fn load_existing(path: &std::path::Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = serde_json::from_str::<Config>(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the gateway cannot serve with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in Tier::ALL {
            let limits = self
                .rate_limit
                .tiers
                .get(&tier)
                .ok_or(ConfigError::MissingTier(tier))?;
            if let Some(reason) = limits.problem() {
                return Err(ConfigError::InvalidTier { tier, reason });
            }
        }

        for class in [
            TtlClass::Realtime,
            TtlClass::Intraday,
            TtlClass::Daily,
            TtlClass::Static,
        ] {
            if !(1..=MAX_TTL_SECS).contains(&self.cache.ttl_classes.seconds(class)) {
                return Err(ConfigError::InvalidTtl(class));
            }
        }
        if self.cache.max_param_len == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.max_param_len",
                reason: "must be positive",
            });
        }
        if !(1..=22).contains(&self.cache.zstd_level) {
            return Err(ConfigError::Invalid {
                field: "cache.zstd_level",
                reason: "must be between 1 and 22",
            });
        }

        let db = &self.database;
        if db.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        let mut seen = std::collections::HashSet::new();
        for endpoint in &db.endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(ConfigError::InvalidEndpoint {
                    name: endpoint.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            if !seen.insert(endpoint.name.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.name.clone()));
            }
            if !is_supported_address(&endpoint.address) {
                return Err(ConfigError::InvalidEndpoint {
                    name: endpoint.name.clone(),
                    reason: format!("unsupported address {:?}", endpoint.address),
                });
            }
        }
        if db.query_timeout_ms == 0 || db.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "database timeouts",
                reason: "must be positive",
            });
        }
        if db.probe_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "database.probe_interval_secs",
                reason: "must be positive",
            });
        }
        if db.failure_threshold == 0 || db.batch_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "database.failure_threshold/batch_concurrency",
                reason: "must be positive",
            });
        }
        Ok(())
    }
}
