//! Admission control.
//!
//! - [`tier`]: subscription tiers, quota table and subject directory
//! - [`limiter`]: hybrid token-bucket + sliding-window limiter

pub mod limiter;
pub mod tier;

pub use limiter::{Admission, RateLimiter, Usage};
pub use tier::{LimiterPolicy, Tier, TierLimits};
