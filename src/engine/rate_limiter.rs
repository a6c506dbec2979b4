//! Per-connector rate limiting.
//!
//! Each external service gets one token-bucket limiter shared (via `Arc`)
//! by every concurrent workflow execution that dispatches to it. Lexoffice
//! enforces a strict 2 requests/second; Paperless is effectively
//! unconstrained but still routed through a (generous) bucket so both
//! connectors follow the same code path.
//!
//! Token accounting is lock-free: tokens are stored scaled by 1000 in an
//! atomic and refilled from elapsed monotonic time on every access.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};
use crate::workflow::ServiceKind;

/// Rate limit parameters: sustained rate over a window, plus burst size.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens added per window.
    pub requests_per_window: u32,
    /// Window duration.
    pub window: Duration,
    /// Tokens available immediately after an idle period.
    pub burst_size: u32,
}

impl RateLimitConfig {
    /// Sustained requests per second with the given burst.
    pub fn per_second(requests: u32, burst: u32) -> Self {
        Self {
            requests_per_window: requests,
            window: Duration::from_secs(1),
            burst_size: burst.max(1),
        }
    }

    /// A bucket so large it never throttles in practice.
    pub fn unconstrained() -> Self {
        Self::per_second(10_000, 100)
    }
}

/// Shared token-bucket gate bounding outbound call rate to one connector.
pub struct RateLimiter {
    service: ServiceKind,
    /// Available tokens, scaled by 1000 for sub-token refill precision.
    tokens: AtomicU64,
    max_tokens: u64,
    /// Refill per millisecond, scaled by 1000.
    refill_rate: u64,
    /// Milliseconds since `epoch` at the last refill.
    last_refill: AtomicU64,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new(service: ServiceKind, config: RateLimitConfig) -> Self {
        let max_tokens = (config.burst_size as u64) * 1000;
        let window_millis = config.window.as_millis().max(1) as u64;
        let refill_rate = ((config.requests_per_window as u64) * 1000) / window_millis;

        Self {
            service,
            tokens: AtomicU64::new(max_tokens),
            max_tokens,
            // At least 1/ms so a misconfigured zero rate cannot stall forever.
            refill_rate: refill_rate.max(1),
            last_refill: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    /// Take one token if available, without waiting.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            if current < 1000 {
                return false;
            }
            if self
                .tokens
                .compare_exchange(current, current - 1000, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            // CAS lost, retry
        }
    }

    /// Wait for a token, up to `max_wait`.
    ///
    /// Suspends the caller until capacity is available. When the wait
    /// budget elapses first the call fails with [`Error::RateLimitTimeout`],
    /// which the dispatch layer treats as non-retryable so the executor's
    /// fail-fast policy applies.
    pub async fn acquire(&self, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + max_wait;

        loop {
            if self.try_acquire() {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(service = %self.service, waited_ms = max_wait.as_millis() as u64,
                    "rate limiter wait budget exhausted");
                return Err(Error::RateLimitTimeout {
                    service: self.service,
                    waited_ms: max_wait.as_millis() as u64,
                });
            }

            let pause = self.next_token_in().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Currently available whole tokens.
    pub fn available_tokens(&self) -> u32 {
        self.refill();
        (self.tokens.load(Ordering::SeqCst) / 1000) as u32
    }

    /// Estimate of the time until one full token has been refilled.
    fn next_token_in(&self) -> Duration {
        let current = self.tokens.load(Ordering::SeqCst);
        let missing = 1000u64.saturating_sub(current);
        if missing == 0 {
            return Duration::from_millis(1);
        }
        Duration::from_millis((missing / self.refill_rate).max(1))
    }

    fn refill(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last);
        if elapsed == 0 {
            return;
        }

        let tokens_to_add = elapsed * self.refill_rate;
        loop {
            let current = self.tokens.load(Ordering::SeqCst);
            let new_tokens = (current + tokens_to_add).min(self.max_tokens);
            if self
                .tokens
                .compare_exchange(current, new_tokens, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.last_refill.store(now, Ordering::SeqCst);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_available_immediately_then_exhausted() {
        let limiter = RateLimiter::new(
            ServiceKind::Lexoffice,
            RateLimitConfig {
                requests_per_window: 2,
                window: Duration::from_secs(1),
                burst_size: 3,
            },
        );

        for _ in 0..3 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn sustained_rate_bounds_a_window() {
        // burst 2 + 2/s sustained: an immediate volley can never exceed
        // burst, and the bucket refills no faster than the configured rate.
        let limiter = RateLimiter::new(ServiceKind::Lexoffice, RateLimitConfig::per_second(2, 2));

        let mut granted = 0;
        for _ in 0..10 {
            if limiter.try_acquire() {
                granted += 1;
            }
        }
        assert_eq!(granted, 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        // 100 tokens/s: a drained bucket refills within ~10ms.
        let limiter = RateLimiter::new(ServiceKind::Paperless, RateLimitConfig::per_second(100, 1));
        assert!(limiter.try_acquire());

        limiter
            .acquire(Duration::from_millis(500))
            .await
            .expect("token should refill well within the wait budget");
    }

    #[tokio::test]
    async fn acquire_times_out_when_budget_elapses() {
        // 1 token per 10 minutes: nothing refills during the test.
        let limiter = RateLimiter::new(
            ServiceKind::Lexoffice,
            RateLimitConfig {
                requests_per_window: 1,
                window: Duration::from_secs(600),
                burst_size: 1,
            },
        );
        assert!(limiter.try_acquire());

        let err = limiter
            .acquire(Duration::from_millis(20))
            .await
            .expect_err("bucket is empty and must not refill in time");
        assert!(matches!(err, Error::RateLimitTimeout { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn concurrent_acquisition_never_overspends() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(
            ServiceKind::Lexoffice,
            RateLimitConfig {
                requests_per_window: 1,
                window: Duration::from_secs(600),
                burst_size: 5,
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.try_acquire() }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
