//! Tiered TTL policy: maps a data-type tag to a time-to-live class.
//!
//! Real-time quotes and rankings churn in minutes, intraday K-lines and
//! searches in tens of minutes, reference data (symbol lists, calendars)
//! stays valid for hours. Unknown data types land in the intraday class.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Freshness class of a cached payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtlClass {
    Realtime,
    Intraday,
    Daily,
    Static,
}

impl TtlClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlClass::Realtime => "realtime",
            TtlClass::Intraday => "intraday",
            TtlClass::Daily => "daily",
            TtlClass::Static => "static",
        }
    }

    /// Compact wire tag used by the cache envelope.
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            TtlClass::Realtime => 0,
            TtlClass::Intraday => 1,
            TtlClass::Daily => 2,
            TtlClass::Static => 3,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(TtlClass::Realtime),
            1 => Some(TtlClass::Intraday),
            2 => Some(TtlClass::Daily),
            3 => Some(TtlClass::Static),
            _ => None,
        }
    }
}

impl std::fmt::Display for TtlClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Duration of each TTL class, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlClasses {
    pub realtime: u64,
    pub intraday: u64,
    pub daily: u64,
    #[serde(rename = "static")]
    pub static_data: u64,
}

impl Default for TtlClasses {
    fn default() -> Self {
        Self {
            realtime: 300,      // 5 min
            intraday: 1_800,    // 30 min
            daily: 86_400,      // 1 day
            static_data: 86_400,
        }
    }
}

impl TtlClasses {
    pub fn seconds(&self, class: TtlClass) -> u64 {
        match class {
            TtlClass::Realtime => self.realtime,
            TtlClass::Intraday => self.intraday,
            TtlClass::Daily => self.daily,
            TtlClass::Static => self.static_data,
        }
    }
}

/// Built-in data-type assignments. Config entries override these.
pub fn default_assignments() -> HashMap<String, TtlClass> {
    let table: &[(&str, TtlClass)] = &[
        ("realtime_quote", TtlClass::Realtime),
        ("ranking", TtlClass::Realtime),
        ("market_overview", TtlClass::Realtime),
        ("kline_intraday", TtlClass::Intraday),
        ("search", TtlClass::Intraday),
        ("stock_detail", TtlClass::Intraday),
        ("kline_daily", TtlClass::Daily),
        ("financial", TtlClass::Daily),
        ("stock_basic", TtlClass::Daily),
        ("trade_calendar", TtlClass::Static),
        ("industry_list", TtlClass::Static),
        ("index_list", TtlClass::Static),
    ];
    table
        .iter()
        .map(|(tag, class)| (tag.to_string(), *class))
        .collect()
}

/// Static lookup table from data-type tag to TTL.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    classes: TtlClasses,
    assignments: HashMap<String, TtlClass>,
    fallback: TtlClass,
}

impl TtlPolicy {
    /// Build a policy from class durations plus per-data-type overrides
    /// layered on top of the built-in assignments.
    pub fn new(classes: TtlClasses, overrides: &HashMap<String, TtlClass>) -> Self {
        let mut assignments = default_assignments();
        assignments.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self {
            classes,
            assignments,
            fallback: TtlClass::Intraday,
        }
    }

    pub fn class_for(&self, data_type: &str) -> TtlClass {
        self.assignments
            .get(data_type)
            .copied()
            .unwrap_or(self.fallback)
    }

    pub fn ttl_for(&self, data_type: &str) -> Duration {
        Duration::from_secs(self.classes.seconds(self.class_for(data_type)))
    }

    pub fn classes(&self) -> &TtlClasses {
        &self.classes
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(TtlClasses::default(), &HashMap::new())
    }
}
