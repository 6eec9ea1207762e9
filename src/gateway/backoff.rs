//! Retry-on-rate-limit executor with exponential backoff and jitter

use chrono::Utc;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::error::{GatewayError, ProviderError};
use crate::gateway::classify::{classify, duration_millis, ErrorClass};
use crate::gateway::metrics::MetricsRecorder;
use crate::gateway::policy::RateLimitPolicy;

/// Runs one operation, retrying it while the provider rate-limits it
#[derive(Debug, Clone)]
pub struct BackoffExecutor {
    policy: RateLimitPolicy,
    metrics: Arc<MetricsRecorder>,
    cancel: CancellationToken,
}

impl BackoffExecutor {
    pub fn new(policy: RateLimitPolicy, metrics: Arc<MetricsRecorder>) -> Self {
        Self::with_cancellation(policy, metrics, CancellationToken::new())
    }

    /// Executor whose backoff sleeps abort when `cancel` fires
    pub fn with_cancellation(
        policy: RateLimitPolicy,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            policy,
            metrics,
            cancel,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Attempt `operation` up to `max_retries + 1` times.
    ///
    /// Only rate-limit failures are retried; anything else is returned on the
    /// attempt that produced it.
    pub async fn execute<T, F, Fut>(&self, mut operation: F, label: &str) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt: u32 = 0;
        let mut last_retry_after: Option<Duration> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(GatewayError::Cancelled {
                    operation: label.to_string(),
                });
            }

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(
                            "'{}' succeeded after {} rate-limit retr{}",
                            label,
                            attempt,
                            if attempt == 1 { "y" } else { "ies" }
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let retry_after = match classify(&err) {
                ErrorClass::Terminal => {
                    debug!("'{}' failed with non-retryable error: {}", label, err);
                    return Err(GatewayError::Provider(err));
                }
                ErrorClass::Retryable { retry_after } => retry_after,
            };
            if retry_after.is_some() {
                last_retry_after = retry_after;
            }

            if attempt >= self.policy.max_retries {
                let retry_after_ms = last_retry_after.map(duration_millis);
                let next_retry_at = last_retry_after
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d);
                error!(
                    "'{}' still rate limited after {} attempt(s), giving up",
                    label,
                    attempt.saturating_add(1)
                );
                return Err(GatewayError::RateLimited {
                    operation: label.to_string(),
                    attempts: attempt.saturating_add(1),
                    retried: attempt > 0,
                    retry_after_ms,
                    next_retry_at,
                    source: err,
                });
            }

            self.metrics.record_rate_limit(label, retry_after);
            let delay = self.policy.next_delay(attempt, retry_after);
            warn!(
                "'{}' rate limited (attempt {}/{}), retrying in {}",
                label,
                attempt.saturating_add(1),
                self.policy.max_retries.saturating_add(1),
                format_duration(delay)
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(GatewayError::Cancelled {
                        operation: label.to_string(),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let ms = d.subsec_millis();
    if secs > 0 {
        format!("{}s {}ms", secs, ms)
    } else {
        format!("{}ms", ms)
    }
}
