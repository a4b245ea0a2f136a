//! Hybrid token-bucket + sliding-window admission control.
//!
//! The bucket bounds bursts to `burst_capacity`; the per-second window
//! counters bound sustained traffic to `rpm` and `rph`. A request is
//! charged against both or neither.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{Millis, SharedClock};
use crate::metrics::Metrics;
use crate::ratelimit::tier::{LimiterPolicy, Tier, TierLimits};

const MINUTE_SECS: u64 = 60;
const HOUR_SECS: u64 = 3_600;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Current standing of one subject.
#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub tier: Tier,
    pub tokens: f64,
    pub last_minute: u64,
    pub last_hour: u64,
}

#[derive(Debug, Clone)]
struct SubjectState {
    tier: Tier,
    tokens: f64,
    last_refill_at: Millis,
    /// (unix second, requests admitted in that second), oldest first.
    window: VecDeque<(u64, u32)>,
    last_seen: Millis,
}

impl SubjectState {
    fn fresh(tier: Tier, limits: &TierLimits, now: Millis) -> Self {
        Self {
            tier,
            tokens: limits.burst_capacity as f64,
            last_refill_at: now,
            window: VecDeque::new(),
            last_seen: now,
        }
    }

    fn refill(&mut self, limits: &TierLimits, now: Millis) {
        let elapsed = now.saturating_sub(self.last_refill_at) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * limits.rps as f64).min(limits.burst_capacity as f64);
        self.last_refill_at = self.last_refill_at.max(now);
    }

    fn prune(&mut self, now_sec: u64) {
        while let Some(&(sec, _)) = self.window.front() {
            if sec + HOUR_SECS <= now_sec {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_sum(&self, now_sec: u64, span: u64) -> u64 {
        self.window
            .iter()
            .filter(|(sec, _)| sec + span > now_sec)
            .map(|(_, count)| u64::from(*count))
            .sum()
    }

    /// Time until one more request fits in the trailing `span`, if it does not already.
    fn window_wait(&self, now: Millis, span: u64, limit: u32) -> Option<Duration> {
        let now_sec = now / 1000;
        let limit = u64::from(limit);
        let mut sum = self.window_sum(now_sec, span);
        if sum < limit {
            return None;
        }
        for (sec, count) in self.window.iter().filter(|(sec, _)| sec + span > now_sec) {
            sum -= u64::from(*count);
            if sum < limit {
                let frees_at = (sec + span) * 1000;
                return Some(at_least_one_ms(frees_at.saturating_sub(now)));
            }
        }
        Some(Duration::from_secs(span))
    }

    fn token_wait(&self, limits: &TierLimits) -> Option<Duration> {
        if self.tokens >= 1.0 {
            return None;
        }
        let secs = (1.0 - self.tokens) / limits.rps as f64;
        Some(at_least_one_ms((secs * 1000.0).ceil() as u64))
    }

    fn check_and_charge(&mut self, limits: &TierLimits, now: Millis) -> Admission {
        let now_sec = now / 1000;
        self.last_seen = now;
        self.refill(limits, now);
        self.prune(now_sec);

        let retry_after = [
            self.token_wait(limits),
            self.window_wait(now, MINUTE_SECS, limits.rpm),
            self.window_wait(now, HOUR_SECS, limits.rph),
        ]
        .into_iter()
        .flatten()
        .max();

        if let Some(retry_after) = retry_after {
            return Admission::Rejected { retry_after };
        }

        self.tokens -= 1.0;
        match self.window.back_mut() {
            Some((sec, count)) if *sec == now_sec => *count += 1,
            _ => self.window.push_back((now_sec, 1)),
        }
        Admission::Allowed
    }
}

fn at_least_one_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Per-subject admission gate.
pub struct RateLimiter {
    policy: ArcSwap<LimiterPolicy>,
    states: DashMap<String, SubjectState>,
    clock: SharedClock,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(policy: LimiterPolicy, clock: SharedClock, metrics: Arc<Metrics>) -> Self {
        Self {
            policy: ArcSwap::from_pointee(policy),
            states: DashMap::new(),
            clock,
            metrics,
        }
    }

    /// Check and, if admitted, charge one request for `subject` at `tier`.
    pub fn admit(&self, subject: &str, tier: Tier) -> Admission {
        let limits = self.policy.load().limits(tier);
        let now = self.clock.now_millis();

        let decision = {
            let mut state = self
                .states
                .entry(subject.to_string())
                .or_insert_with(|| SubjectState::fresh(tier, &limits, now));
            if state.tier != tier {
                debug!(subject, from = %state.tier, to = %tier, "tier changed, resetting limiter state");
                *state = SubjectState::fresh(tier, &limits, now);
            }
            state.check_and_charge(&limits, now)
        };

        let outcome = if decision.is_allowed() {
            "allowed"
        } else {
            "rejected"
        };
        self.metrics
            .admissions
            .with_label_values(&[tier.as_str(), outcome])
            .inc();
        if let Admission::Rejected { retry_after } = decision {
            debug!(subject, %tier, retry_after_ms = retry_after.as_millis() as u64, "request rejected");
        }
        decision
    }

    /// Registered tier of a subject (lowest tier when unknown).
    pub fn tier_for(&self, subject: &str) -> Tier {
        self.policy.load().tier_for(subject)
    }

    /// Swap in a new tier table and subject directory.
    pub fn reload(&self, policy: LimiterPolicy) {
        self.policy.store(Arc::new(policy));
        info!("rate limiter policy reloaded");
    }

    pub fn policy(&self) -> Arc<LimiterPolicy> {
        self.policy.load_full()
    }

    pub fn usage(&self, subject: &str) -> Option<Usage> {
        let now = self.clock.now_millis();
        let now_sec = now / 1000;
        self.states.get(subject).map(|state| {
            let limits = self.policy.load().limits(state.tier);
            let elapsed = now.saturating_sub(state.last_refill_at) as f64 / 1000.0;
            Usage {
                tier: state.tier,
                tokens: (state.tokens + elapsed * limits.rps as f64)
                    .min(limits.burst_capacity as f64),
                last_minute: state.window_sum(now_sec, MINUTE_SECS),
                last_hour: state.window_sum(now_sec, HOUR_SECS),
            }
        })
    }

    /// Forget a subject entirely.
    pub fn reset(&self, subject: &str) -> bool {
        self.states.remove(subject).is_some()
    }

    /// Drop subjects idle for longer than `max_idle` (never less than an hour,
    /// so no live window count is lost). Returns how many were removed.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now_millis();
        let max_idle_ms = (max_idle.as_millis() as u64).max(HOUR_SECS * 1000);
        let before = self.states.len();
        self.states
            .retain(|_, state| now.saturating_sub(state.last_seen) < max_idle_ms);
        before.saturating_sub(self.states.len())
    }

    pub fn tracked_subjects(&self) -> usize {
        self.states.len()
    }
}
