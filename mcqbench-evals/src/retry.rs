// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Retry controller for model requests.
//!
//! Each physical attempt takes a fresh rate-limiter admission and runs under
//! its own timeout. Timeouts and retriable errors back off and retry until
//! the attempt budget is spent; fatal errors stop immediately.

use crate::llm_client::RequestError;
use mcqbench_core::{AttemptStatus, EvaluationAttempt, LlmApiConfig, RateLimiter, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Final result of a retried call plus the record of every attempt
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, RequestError>,
    pub attempts: Vec<EvaluationAttempt>,
}

impl<T> RetryOutcome<T> {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    timeout: Duration,
    limiter: Arc<RateLimiter>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, timeout: Duration, limiter: Arc<RateLimiter>) -> Self {
        Self {
            policy,
            timeout,
            limiter,
        }
    }

    pub fn from_config(api: &LlmApiConfig, limiter: Arc<RateLimiter>) -> Self {
        Self::new(api.retry_policy(), api.timeout(), limiter)
    }

    /// Run `operation` until it succeeds, fails fatally or the budget is spent
    pub async fn call<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = Vec::with_capacity(max_attempts as usize);
        let mut last_error = RequestError::retriable("no attempt made");

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    "Retrying request (attempt {}/{}) in {:?}: {}",
                    attempt + 1,
                    max_attempts,
                    delay,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }

            self.limiter.acquire().await;
            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(RequestError::retriable(format!(
                    "request timed out after {:?}",
                    self.timeout
                ))),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(value) => {
                    tracing::debug!("Attempt {} succeeded in {} ms", attempt + 1, elapsed_ms);
                    attempts.push(EvaluationAttempt {
                        attempt,
                        elapsed_ms,
                        status: AttemptStatus::Success,
                        error: None,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(err) => {
                    tracing::debug!("Attempt {} failed after {} ms: {}", attempt + 1, elapsed_ms, err);
                    let retriable = err.is_retriable();
                    attempts.push(EvaluationAttempt {
                        attempt,
                        elapsed_ms,
                        status: if retriable {
                            AttemptStatus::Retriable
                        } else {
                            AttemptStatus::Fatal
                        },
                        error: Some(err.to_string()),
                    });
                    if !retriable {
                        return RetryOutcome {
                            result: Err(err),
                            attempts,
                        };
                    }
                    last_error = err;
                }
            }
        }

        RetryOutcome {
            result: Err(RequestError::Fatal {
                status: last_error.status(),
                message: format!(
                    "retries exhausted after {} attempts: {}",
                    max_attempts, last_error
                ),
            }),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: max_retries + 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    fn controller(max_retries: u32, timeout: Duration) -> RetryController {
        RetryController::new(
            policy(max_retries),
            timeout,
            Arc::new(RateLimiter::unlimited()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_bounded_attempts() {
        let controller = controller(3, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let outcome = controller
            .call(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RequestError::from_status(503, "overloaded"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempt_count(), 4);
        assert!(matches!(
            outcome.result,
            Err(RequestError::Fatal {
                status: Some(503),
                ..
            })
        ));
        assert!(outcome
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::Retriable));
        // 100 + 200 + 400 ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(700));
        assert_eq!(started.elapsed(), policy(3).total_backoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_short_circuits() {
        let controller = controller(3, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller
            .call(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(RequestError::from_status(401, "bad key"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts[0].status, AttemptStatus::Fatal);
        assert_eq!(outcome.result.unwrap_err().status(), Some(401));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let controller = controller(3, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = controller
            .call(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RequestError::retriable("connection reset"))
                    } else {
                        Ok("\\box{A}")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.clone().unwrap(), "\\box{A}");
        assert_eq!(outcome.attempt_count(), 3);
        assert_eq!(outcome.attempts[2].status, AttemptStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retriable() {
        let controller = controller(1, Duration::from_secs(2));
        let started = Instant::now();

        let outcome = controller
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, RequestError>(())
            })
            .await;

        assert_eq!(outcome.attempt_count(), 2);
        assert!(outcome.result.is_err());
        assert!(outcome.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
        // two timeouts plus one backoff
        assert_eq!(started.elapsed(), Duration::from_millis(4100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_attempt_takes_limiter_admission() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        };
        let controller = RetryController::new(
            policy,
            Duration::from_secs(5),
            Arc::new(RateLimiter::new(1.0)),
        );
        let started = Instant::now();

        let outcome = controller
            .call(|| async { Err::<(), _>(RequestError::retriable("busy")) })
            .await;

        assert_eq!(outcome.attempt_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }
}
