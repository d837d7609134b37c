use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

/// Runs the future produced by `get_future` until it succeeds or the policy gives up.
pub async fn with_retry<F, Fut, R, Err>(get_future: F, policy: RetryPolicy) -> Result<R, Err>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<R, Err>>,
{
    with_retry_if(get_future, policy, |_| true).await
}

/// Like [with_retry], but an error for which `should_retry` returns false is returned immediately.
pub async fn with_retry_if<F, Fut, R, Err, P>(
    get_future: F,
    policy: RetryPolicy,
    should_retry: P,
) -> Result<R, Err>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<R, Err>>,
    P: Fn(&Err) -> bool,
{
    let mut err_count: u64 = 0;

    loop {
        match get_future().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                err_count = err_count.saturating_add(1);

                if err_count >= policy.max_attempts() || !should_retry(&err) {
                    return Err(err);
                }

                let delay = policy.delay(err_count);
                debug!(attempt = err_count, delay = ?delay, "retrying failed operation");
                sleep(delay).await;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    RepeatConstant {
        sleep: Duration,
        max_attempts: u64,
    },
    /// The delay doubles after every failed attempt, starting at `initial_delay` and capped at `max_delay`.
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: u64,
    },
}

impl RetryPolicy {
    pub fn repeat_constant(sleep: Duration, max_attempts: u64) -> Self {
        RetryPolicy::RepeatConstant {
            sleep,
            max_attempts,
        }
    }

    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u64) -> Self {
        RetryPolicy::Exponential {
            initial_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u64 {
        match self {
            RetryPolicy::RepeatConstant { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    /// Delay before the next attempt after `failed_attempts` consecutive failures.
    pub fn delay(&self, failed_attempts: u64) -> Duration {
        match self {
            RetryPolicy::RepeatConstant { sleep, .. } => *sleep,
            RetryPolicy::Exponential {
                initial_delay,
                max_delay,
                ..
            } => {
                let exponent = u32::try_from(failed_attempts.saturating_sub(1)).unwrap_or(u32::MAX);

                initial_delay
                    .checked_mul(2u32.saturating_pow(exponent))
                    .unwrap_or(*max_delay)
                    .min(*max_delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn exponential_delay_doubles_until_capped() {
        let policy =
            RetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500), 10);

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(u64::MAX), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU64::new(0);
        let start = Instant::now();

        let result = with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(())
                } else {
                    Ok(5)
                }
            },
            RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10), 5),
        )
        .await;

        assert_eq!(result, Ok(5));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU64::new(0);

        let result: Result<(), &str> = with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("unavailable")
            },
            RetryPolicy::repeat_constant(Duration::from_secs(1), 3),
        )
        .await;

        assert_eq!(result, Err("unavailable"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_when_predicate_rejects_error() {
        let calls = AtomicU64::new(0);

        let result: Result<(), bool> = with_retry_if(
            || async {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                // first failure is retryable, the second one is not
                Err(call == 0)
            },
            RetryPolicy::repeat_constant(Duration::from_secs(1), 10),
            |retryable| *retryable,
        )
        .await;

        assert_eq!(result, Err(false));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
