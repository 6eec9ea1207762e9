//! Rate-limited gateway for generative-AI calls.
//!
//! A call is admitted by the [`ConcurrencyQueue`], deduplicated by the
//! [`Coalescer`] and executed by the [`BackoffExecutor`], in that order.
//! Because admission comes first, two duplicate calls each wait for a queue
//! slot and only merge once admitted.

pub mod backoff;
pub mod classify;
pub mod coalesce;
pub mod metrics;
pub mod policy;
pub mod queue;

use futures::future::FutureExt;
use log::info;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::config::GatewayConfig;
use crate::core::error::{GatewayError, ProviderError};
use crate::providers::GenerateResponse;

pub use backoff::BackoffExecutor;
pub use classify::{classify, classify_value, ErrorClass};
pub use coalesce::Coalescer;
pub use metrics::{GatewayMetrics, MetricsRecorder};
pub use policy::RateLimitPolicy;
pub use queue::ConcurrencyQueue;

/// Queue → coalescing → backoff, bundled behind one call path
pub struct Gateway<T> {
    queue: ConcurrencyQueue,
    coalescer: Coalescer<T>,
    metrics: Arc<MetricsRecorder>,
    executor: BackoffExecutor,
    shutdown: CancellationToken,
}

impl<T> Gateway<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_policy(
            config.rate_limit_policy(),
            config.max_concurrency,
            config.coalesce_window(),
        )
    }

    pub fn with_policy(policy: RateLimitPolicy, max_concurrency: usize, coalesce_window: Duration) -> Self {
        let metrics = Arc::new(MetricsRecorder::new());
        let shutdown = CancellationToken::new();
        let executor = BackoffExecutor::with_cancellation(policy, Arc::clone(&metrics), shutdown.clone());
        info!(
            "Gateway ready: max_concurrency={}, coalesce_window={:?}, max_retries={}",
            max_concurrency.max(1),
            coalesce_window,
            executor.policy().max_retries
        );
        Self {
            queue: ConcurrencyQueue::new(max_concurrency),
            coalescer: Coalescer::new(coalesce_window),
            metrics,
            executor,
            shutdown,
        }
    }

    /// Run `operation` through the gateway.
    ///
    /// `prompt` and `model` form the coalescing key; `label` names the
    /// operation in logs and metrics.
    pub async fn call<F, Fut>(&self, operation: F, prompt: &str, model: &str, label: &str) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        self.call_with_cancel(operation, prompt, model, label, &CancellationToken::new())
            .await
    }

    /// [`Gateway::call`] that the caller can abandon through `cancel`.
    ///
    /// Cancelling while queued withdraws the job. Cancelling while attached
    /// to a shared execution detaches this caller only.
    pub async fn call_with_cancel<F, Fut>(
        &self,
        operation: F,
        prompt: &str,
        model: &str,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ProviderError>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Shutdown);
        }

        let executor = self.executor.clone();
        let owned_label = label.to_string();
        let job_id = format!("{}:{}", label, Uuid::new_v4());

        let job = self.coalescer.execute(model, prompt, label, move || {
            async move { executor.execute(operation, &owned_label).await }.boxed()
        });
        self.queue.enqueue(Some(job_id), cancel, job).await
    }

    /// Rate-limit counters plus current queue occupancy
    pub fn metrics(&self) -> GatewayMetrics {
        let (queue_length, in_flight) = self.queue.occupancy();
        self.metrics.snapshot(queue_length, in_flight)
    }

    /// Zero the counters; queue state is untouched
    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        self.executor.policy()
    }

    pub fn max_concurrency(&self) -> usize {
        self.queue.max_concurrency()
    }

    /// Dispose of the gateway: waiting jobs fail with `Shutdown`, backoff
    /// sleeps abort with `Cancelled`, new calls are refused.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Gateway shutting down");
        }
        self.shutdown.cancel();
        self.queue.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

static GLOBAL: OnceLock<Arc<Gateway<GenerateResponse>>> = OnceLock::new();

impl Gateway<GenerateResponse> {
    /// Process-wide gateway, built from [`GatewayConfig::from_env`] on first
    /// use and never reconfigured afterwards. Callers needing a different
    /// policy should build their own [`Gateway`].
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Gateway::new(&GatewayConfig::from_env()))))
    }
}

/// Run a Gemini call through the process-wide gateway
pub async fn call_gemini_with_backoff<F, Fut>(
    operation: F,
    prompt: &str,
    model: &str,
    label: &str,
) -> Result<GenerateResponse, GatewayError>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<GenerateResponse, ProviderError>> + Send + 'static,
{
    Gateway::global().call(operation, prompt, model, label).await
}
