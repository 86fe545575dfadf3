// Retry-with-backoff shared by segment and key fetching.
//
// Segments back off linearly (1 s, 2 s, 3 s by default), keys exponentially. Both honour the
// session's cancellation token between attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * (attempt + 1)`
    Linear,
    /// `base * 2^attempt`
    Exponential,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Adds random jitter of [0, base_delay/2) so parallel sessions drift apart.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn linear(max_retries: u32, step: Duration) -> Self {
        Self {
            max_retries,
            base_delay: step,
            max_delay: step.saturating_mul(max_retries.max(1)),
            backoff: Backoff::Linear,
            jitter: false,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
            jitter: true,
        }
    }

    /// Total number of attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.backoff {
            Backoff::Linear => attempt.saturating_add(1),
            // Checked shift so attempts >= 32 saturate
            Backoff::Exponential => 1u32.checked_shl(attempt).unwrap_or(u32::MAX),
        };
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Outcome of a single attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure (network, 5xx, timeout)
    Retry(Error),
    /// Permanent failure (4xx, parse error)
    Fail(Error),
}

impl<T> From<Result<T>> for RetryAction<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy is exhausted.
///
/// The closure receives the 0-indexed attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn linear_delays_grow_by_one_step() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(3));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn exponential_delay_respects_cap_with_jitter() {
        let policy =
            RetryPolicy::exponential(10, Duration::from_millis(500), Duration::from_secs(1));
        for _ in 0..32 {
            assert!(policy.delay_for_attempt(10) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn exponential_jitter_stays_within_half_base() {
        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(10));
        let delay = policy.delay_for_attempt(0);
        assert!(delay >= Duration::from_millis(100));
        assert!(delay < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn non_retryable_fails_after_one_attempt() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::from(Err(Error::rejected(
                    "https://cdn/a.ts",
                    reqwest::StatusCode::NOT_FOUND,
                )))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::UpstreamRejected { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_spaced_linearly_then_exhausted() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<u32> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(Error::unavailable("https://cdn/a.ts", "reset")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 4);
        // 1 s + 2 s + 3 s between the four attempts
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn succeeds_on_a_later_attempt() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        let result = retry_with_backoff(&policy, &token, |attempt| async move {
            if attempt < 2 {
                RetryAction::Retry(Error::unavailable("u", "reset"))
            } else {
                RetryAction::Success(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_attempt() {
        let policy = RetryPolicy::linear(3, Duration::from_millis(1));
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<u32> =
            retry_with_backoff(&policy, &token, |_| async { RetryAction::Success(1) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
