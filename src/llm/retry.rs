//! Bounded exponential backoff for transient service failures.
//!
//! Only errors flagged `is_retryable()` are re-attempted; request-shape
//! defects (dimension mismatch, empty document, unsupported format) fail
//! immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::core::config::RetryConfig;
use crate::core::errors::RagError;

/// Run `op` with retries per `config`. Each retry doubles the delay and
/// adds up to 50% jitter.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, RagError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RagError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay = backoff_delay(config.base_delay_ms, attempt);
                tracing::warn!(
                    "retryable failure (attempt {}/{}), backing off {:?}: {}",
                    attempt + 1,
                    config.max_retries,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let jitter = rand::rng().random_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_config(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RagError::EmbeddingService("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_shape_defects() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(RagError::DimensionMismatch {
                    expected: 3,
                    actual: 4,
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_retry_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RagError::GenerationService("down".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4); // initial + 3 retries
    }
}
