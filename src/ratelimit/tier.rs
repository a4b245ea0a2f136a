//! Subscription tiers and their quota table.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Subscription tier of a caller. Ordered from least to most generous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Basic, Tier::Premium, Tier::Enterprise];

    /// The tier applied to callers nobody has registered.
    pub fn lowest() -> Tier {
        Tier::Free
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Basic => "basic",
            Tier::Premium => "premium",
            Tier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quotas for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Token refill rate (tokens per second).
    pub rps: u32,
    /// Requests allowed in any trailing 60 seconds.
    pub rpm: u32,
    /// Requests allowed in any trailing 3600 seconds.
    pub rph: u32,
    /// Token bucket capacity.
    pub burst_capacity: u32,
}

impl TierLimits {
    pub const fn new(rps: u32, rpm: u32, rph: u32, burst_capacity: u32) -> Self {
        Self {
            rps,
            rpm,
            rph,
            burst_capacity,
        }
    }

    pub(crate) fn problem(&self) -> Option<&'static str> {
        if self.rps == 0 {
            Some("rps must be positive")
        } else if self.burst_capacity == 0 {
            Some("burst_capacity must be positive")
        } else if self.rpm == 0 || self.rph == 0 {
            Some("rpm and rph must be positive")
        } else if self.rph < self.rpm {
            Some("rph must not be smaller than rpm")
        } else {
            None
        }
    }
}

/// Default quota table.
pub fn default_tier_table() -> BTreeMap<Tier, TierLimits> {
    BTreeMap::from([
        (Tier::Free, TierLimits::new(5, 300, 3_000, 5)),
        (Tier::Basic, TierLimits::new(20, 1_000, 20_000, 20)),
        (Tier::Premium, TierLimits::new(50, 3_000, 100_000, 100)),
        (Tier::Enterprise, TierLimits::new(200, 12_000, 500_000, 400)),
    ])
}

/// Immutable snapshot of everything the limiter reads at request time.
///
/// Replaced wholesale on reload; never mutated in place.
#[derive(Debug, Clone)]
pub struct LimiterPolicy {
    tiers: BTreeMap<Tier, TierLimits>,
    subjects: HashMap<String, Tier>,
}

impl LimiterPolicy {
    pub fn new(tiers: BTreeMap<Tier, TierLimits>, subjects: HashMap<String, Tier>) -> Self {
        Self { tiers, subjects }
    }

    /// Limits for `tier`, falling back to the lowest tier's limits.
    pub fn limits(&self, tier: Tier) -> TierLimits {
        self.tiers
            .get(&tier)
            .or_else(|| self.tiers.get(&Tier::lowest()))
            .copied()
            .unwrap_or_else(|| TierLimits::new(1, 60, 3_600, 1))
    }

    /// Registered tier for a subject; unknown subjects get the lowest tier.
    pub fn tier_for(&self, subject: &str) -> Tier {
        self.subjects.get(subject).copied().unwrap_or(Tier::lowest())
    }
}

impl Default for LimiterPolicy {
    fn default() -> Self {
        Self::new(default_tier_table(), HashMap::new())
    }
}
