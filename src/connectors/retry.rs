//! Bounded retry policy for connector calls.
//!
//! Transient failures (HTTP 429, 5xx, transport errors) are retried with
//! exponential backoff and ±25% jitter so concurrent workflow executions
//! hitting the same throttled service do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Retry parameters applied to every outbound connector call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// capped, with ±25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let exp = self.base_delay.saturating_mul(1u32 << shift);
        let capped = exp.min(self.max_delay);

        let jitter_range = capped.as_millis() as u64 / 4;
        if jitter_range == 0 {
            return capped;
        }

        let jitter =
            rand::thread_rng().gen_range(-(jitter_range as i64)..=(jitter_range as i64));
        let millis = (capped.as_millis() as i64).saturating_add(jitter).max(0);
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_within_jitter_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        };

        for (attempt, nominal_ms) in [(1u32, 100u64), (2, 200), (3, 400), (4, 800)] {
            let d = policy.delay(attempt).as_millis() as u64;
            let lo = nominal_ms - nominal_ms / 4;
            let hi = nominal_ms + nominal_ms / 4;
            assert!(
                (lo..=hi).contains(&d),
                "attempt {attempt}: {d}ms outside [{lo}, {hi}]"
            );
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
        };
        // 10s * 2^7 would be over 20 minutes; the cap plus jitter bounds it.
        assert!(policy.delay(8) <= Duration::from_millis(15_000 + 3_750));
    }
}
