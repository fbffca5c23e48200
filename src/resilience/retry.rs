//! Bounded retry with exponential backoff and jitter.

use crate::config::ResilienceConfig;
use crate::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Immutable retry configuration, applied per call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Uniform jitter bounds multiplied into every delay.
    pub jitter: (f64, f64),
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: (0.5, 1.5),
        }
    }

    pub fn with_jitter(mut self, min: f64, max: f64) -> Self {
        let min = min.max(0.0);
        self.jitter = (min, max.max(min));
        self
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry `attempt` (1-based) for a given jitter factor:
    /// `base_delay * 2^(attempt-1) * jitter_factor`, capped at [`MAX_BACKOFF`].
    pub fn delay_for(&self, attempt: u32, jitter_factor: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let secs = self.base_delay.as_secs_f64() * 2f64.powi(exponent) * jitter_factor;
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Delay before retry `attempt` with a freshly drawn jitter factor.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let (min, max) = self.jitter;
        let factor = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        self.delay_for(attempt, factor)
    }

    /// Runs `op`, retrying every error.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(op, |_| true).await
    }

    /// Runs `op`, retrying only errors accepted by `should_retry`. The last
    /// error is returned unchanged once the budget is spent.
    pub async fn run_if<T, F, Fut, P>(&self, mut op: F, should_retry: P) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_retries || !should_retry(&e) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        RetryPolicy::new(config.max_retries, config.base_delay())
            .with_jitter(config.jitter_min, config.jitter_max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}
