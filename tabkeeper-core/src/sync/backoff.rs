//! Retry backoff for failed sync cycles.

use rand::Rng;
use std::time::Duration;

/// Default delay unit for the first retry.
pub const DEFAULT_BASE: Duration = Duration::from_secs(5);
/// Default upper bound for any retry delay.
pub const DEFAULT_CAP: Duration = Duration::from_secs(5 * 60);

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Upper bound of the delay for the given attempt (0-based):
    /// `min(cap, base * 2^attempt)`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    /// Random delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}
