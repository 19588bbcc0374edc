use crate::errors::GatewayError;
use crate::model::{MetricSnapshot, PerformanceDelta};
use crate::providers::warehouse::pool::GatewayPool;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

/// Bounded polling for asynchronously materialising history records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 6,
            initial_delay: Duration::from_millis(500),
            backoff: Backoff::Exponential,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let d = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => self
                .initial_delay
                .saturating_mul(2u32.saturating_pow(attempt.min(16))),
        };
        d.min(self.max_delay)
    }
}

/// Reads both statements' metrics from the history facility and diffs them.
#[derive(Clone)]
pub struct PerformanceComparator {
    pool: Arc<GatewayPool>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl PerformanceComparator {
    /// `call_timeout` bounds each history lookup, not the whole comparison.
    pub fn new(pool: Arc<GatewayPool>, retry: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            pool,
            retry,
            call_timeout,
        }
    }

    /// Fails with `MetricsNotYetAvailable` once the retry budget is spent.
    /// Sessions are released between polls.
    pub async fn compare(&self, original_id: &str, optimized_id: &str) -> Result<PerformanceDelta, GatewayError> {
        let mut original: Option<MetricSnapshot> = None;
        let mut optimized: Option<MetricSnapshot> = None;
        let attempts = self.retry.attempts.max(1);

        for attempt in 0..attempts {
            if original.is_none() {
                original = self.poll(original_id).await?;
            }
            if optimized.is_none() {
                optimized = self.poll(optimized_id).await?;
            }
            if let (Some(o), Some(n)) = (original, optimized) {
                return Ok(PerformanceDelta::between(o, n));
            }
            if attempt + 1 < attempts {
                let delay = self.retry.delay_after(attempt);
                tracing::debug!(
                    event = "snowwise.compare.waiting",
                    original_id,
                    optimized_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64
                );
                tokio::time::sleep(delay).await;
            }
        }

        let missing = if original.is_none() { original_id } else { optimized_id };
        Err(GatewayError::MetricsNotYetAvailable(missing.to_string()))
    }

    async fn poll(&self, query_id: &str) -> Result<Option<MetricSnapshot>, GatewayError> {
        let session = self.pool.acquire().await?;
        let lookup = tokio::time::timeout(self.call_timeout, session.query_history_metrics(query_id));
        match lookup.await {
            Err(_) => Err(GatewayError::Timeout(self.call_timeout.as_secs())),
            Ok(Ok(m)) => Ok(Some(m)),
            Ok(Err(GatewayError::MetricsNotYetAvailable(_))) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }
}
