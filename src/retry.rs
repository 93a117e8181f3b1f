//! Retry backoff strategies and delayed resubmission.
//!
//! A [`RetryPolicy`] wraps a swappable [`BackoffStrategy`]. Scheduling a
//! retry arms a `tokio::time` timer and returns its abort handle; nothing
//! touches the worker pool until the timer fires.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

/// Default backoff table in seconds
pub const DEFAULT_BACKOFF_SECS: [u64; 4] = [5, 15, 30, 60];

/// Computes the delay before the next attempt
pub trait BackoffStrategy: Send + Sync + Debug {
    /// `retry_count` is the number of retries already performed
    fn delay(&self, retry_count: u32) -> Duration;

    fn name(&self) -> &'static str;
}

/// Table-driven backoff; attempts past the end reuse the last entry
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    table: Vec<Duration>,
}

impl ExponentialBackoff {
    pub fn new(table: Vec<Duration>) -> Self {
        if table.is_empty() {
            return Self::default();
        }
        Self { table }
    }

    pub fn table(&self) -> &[Duration] {
        &self.table
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            table: DEFAULT_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        let index = (retry_count as usize).min(self.table.len() - 1);
        self.table[index]
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}

/// `initial + step * retry_count`, capped at `max`
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    pub initial: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, retry_count: u32) -> Duration {
        self.step
            .checked_mul(retry_count)
            .and_then(|extra| self.initial.checked_add(extra))
            .unwrap_or(self.max)
            .min(self.max)
    }

    fn name(&self) -> &'static str {
        "linear"
    }
}

#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, _retry_count: u32) -> Duration {
        self.delay
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

/// Spreads another strategy's delay by up to `ratio` in either direction
#[derive(Debug, Clone)]
pub struct Jittered<S> {
    inner: S,
    ratio: f64,
}

impl<S: BackoffStrategy> Jittered<S> {
    pub fn new(inner: S, ratio: f64) -> Self {
        Self {
            inner,
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl<S: BackoffStrategy> BackoffStrategy for Jittered<S> {
    fn delay(&self, retry_count: u32) -> Duration {
        let base = self.inner.delay(retry_count);
        let factor = 1.0 + self.ratio * (fastrand::f64() * 2.0 - 1.0);
        base.mul_f64(factor.max(0.0))
    }

    fn name(&self) -> &'static str {
        "jittered"
    }
}

/// Retry policy attached to a chain
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    strategy: Arc<dyn BackoffStrategy>,
}

impl RetryPolicy {
    pub fn new(strategy: Arc<dyn BackoffStrategy>) -> Self {
        Self { strategy }
    }

    pub fn exponential(table: Vec<Duration>) -> Self {
        Self::new(Arc::new(ExponentialBackoff::new(table)))
    }

    pub fn linear(initial: Duration, step: Duration, max: Duration) -> Self {
        Self::new(Arc::new(LinearBackoff { initial, step, max }))
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(Arc::new(FixedBackoff { delay }))
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.strategy.delay(retry_count)
    }

    /// Arm a timer that runs `fire` after the backoff delay for
    /// `retry_count`. Returns immediately; abort the handle to cancel.
    pub fn schedule<F, Fut>(&self, chain_id: &str, retry_count: u32, fire: F) -> AbortHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay_for(retry_count);
        debug!(
            chain_id = %chain_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            strategy = self.strategy.name(),
            "Scheduling retry"
        );
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire().await;
        })
        .abort_handle()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Arc::new(ExponentialBackoff::default()))
    }
}
