//! 외부 호출 재시도 (지수 백오프)
//!
//! 임베딩/LLM 경계에서만 사용합니다. `is_retryable()`이 false인 에러는 즉시 반환합니다.

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Result;

/// 제한된 지수 백오프 재시도 정책
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.initial_backoff(), config.max_backoff())
    }

    /// 재시도 없음 (테스트/오프라인용)
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// n번째 재시도 전 대기 시간: min(initial * 2^n, max)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// 연산 실행 (재시도 가능한 에러만 재시도)
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = self.backoff(attempt);
                    tracing::warn!(
                        "{} failed: {}, retrying in {:?} (attempt {}/{})",
                        operation,
                        e,
                        backoff,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500), Duration::from_millis(8000));
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(8000));
        assert_eq!(policy.backoff(31), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(EngineError::external("flaky", "timeout", true))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_surfaced() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(2)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::external("down", "503", true))
            })
            .await;

        assert!(matches!(result, Err(EngineError::ExternalService { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast(5)
            .run("grounding", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::NoGroundingFound { threshold: 0.5 })
            })
            .await;

        assert!(matches!(result, Err(EngineError::NoGroundingFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
