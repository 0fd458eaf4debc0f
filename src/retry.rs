use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect schedule for one interface (or for the downstream probe).
///
/// `delay(n) = min(cap, base * multiplier^n)`. Jitter is drawn from the step
/// between `delay(n - 1)` and `delay(n)`, so the first attempt waits exactly
/// `base_delay_ms`, attempts at the cap wait exactly `cap_delay_ms`, and the
/// jittered schedule stays non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Wait before the first retry.
    pub base_delay_ms: u64,
    /// Growth per failed attempt; values below 1 are treated as 1.
    pub backoff_multiplier: f64,
    /// Upper bound on any single wait.
    pub cap_delay_ms: u64,
    /// Fraction in `[0, 1)` of each backoff step that may be shaved off per
    /// device.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            cap_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A fixed cadence: every attempt waits `interval`.
    pub fn fixed(interval: Duration) -> Self {
        let ms = duration_ms(interval);
        Self {
            max_attempts: None,
            base_delay_ms: ms,
            backoff_multiplier: 1.0,
            cap_delay_ms: ms,
            jitter: 0.0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn cap_delay(&self) -> Duration {
        Duration::from_millis(self.cap_delay_ms)
    }

    /// Deterministic backoff for the zero-based `attempt`. Non-decreasing in
    /// `attempt` and never above the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.cap_delay_ms as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let ms = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::from_millis(ms as u64)
    }

    /// `delay(attempt)` with per-device jitter. `seed` should differ between
    /// deployments (the MAC address works) so that adapters sharing an
    /// outage do not retry in lockstep.
    pub fn jittered_delay(&self, attempt: u32, seed: u64) -> Duration {
        let delay = self.delay(attempt);
        let jitter = self.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 || attempt == 0 {
            return delay;
        }
        let step = delay.saturating_sub(self.delay(attempt - 1));
        if step.is_zero() {
            return delay;
        }
        // Cheap integer hash; only needs to spread, not to be unpredictable.
        let mixed = seed
            .wrapping_add(u64::from(attempt))
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            .rotate_left(29);
        let fraction = (mixed % 1_000) as f64 / 1_000.0;
        delay.saturating_sub(step.mul_f64(jitter * fraction))
    }

    /// Whether `attempts` failed attempts have used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
