use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::PipelineError;

/// `max_attempts` counts every attempt, the first one included. A
/// `multiplier` of 1.0 gives a fixed delay between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_attempts: 4,
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            max_attempts,
            multiplier: 1.0,
        }
    }

    pub fn exponential(max_attempts: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            interval,
            max_interval,
            max_attempts,
            multiplier: 2.0,
        }
    }

    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: Option<RetryPolicy>) -> Self {
        let mut policy = policy.unwrap_or_default();

        if policy.max_attempts == 0 {
            policy.max_attempts = 1;
        }
        if policy.multiplier < 1.0 {
            policy.multiplier = 1.0;
        }
        if policy.max_interval < policy.interval {
            policy.max_interval = policy.interval;
        }

        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, returns a non-retryable error, or
    /// the attempt budget is spent. The closure receives the 1-based attempt
    /// number.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            if ctx.is_cancelled() {
                return Err(PipelineError::ContextCancelled(format!(
                    "cancelled before attempt {} of {}",
                    attempt, task_name
                )));
            }

            let err = match operation(attempt).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= max_attempts {
                if max_attempts == 1 {
                    return Err(err);
                }
                return Err(PipelineError::RetryFailed {
                    task: task_name.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let wait_time = self.calculate_backoff(attempt);
            warn!(
                task = task_name,
                attempt,
                max_attempts,
                error = %err,
                "attempt failed, retrying in {:?}",
                wait_time
            );

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(PipelineError::ContextCancelled(
                        "Context cancelled during retry wait".to_string()
                    ));
                }
                _ = sleep(wait_time) => {}
            }

            attempt += 1;
        }
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = self.policy.interval.as_secs_f64() * self.policy.multiplier.powi(exponent);

        if !backoff.is_finite() || backoff > self.policy.max_interval.as_secs_f64() {
            self.policy.max_interval
        } else {
            Duration::from_secs_f64(backoff)
        }
    }
}
