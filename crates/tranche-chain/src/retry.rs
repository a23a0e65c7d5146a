use crate::ChainError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for outbound settlement calls.
///
/// Only transient outcomes (rate limit, provider unavailable) retry;
/// validation failures and reverts surface on the first attempt.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max)
    }
}

pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    op_name: &str,
    mut call: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    operation = op_name,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "🔄 Transient settlement error, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(), "balance", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ChainError::RateLimited("429".to_string()))
            } else {
                Ok(7u64)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<u64, _> = retry_with_backoff(&fast_policy(), "balance", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ChainError::Unavailable("connection refused".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ChainError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reverts_never_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u64, _> = retry_with_backoff(&fast_policy(), "transfer", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ChainError::Reverted("out of gas".to_string()))
        })
        .await;
        assert!(matches!(result, Err(ChainError::Reverted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
