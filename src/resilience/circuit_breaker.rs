//! Circuit breaker guarding one class of broker operation.
//!
//! The breaker knows nothing about the operation it wraps. It counts
//! consecutive failures while closed, rejects calls while open, and lets a
//! single trial call through once the open timeout has elapsed.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through normally.
    Closed,
    /// Calls fail immediately.
    Open,
    /// One trial call decides between closing and reopening.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    current: CircuitState,
    failure_count: u32,
    last_opened_at: Option<Instant>,
    trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    failure_threshold: u32,
    timeout: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// it reports an outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.admission == Admission::Trial && !self.settled {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            failure_threshold: failure_threshold.max(1),
            timeout,
            state: Mutex::new(BreakerState {
                current: CircuitState::Closed,
                failure_count: 0,
                last_opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Current state, moving OPEN to HALF_OPEN once the timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);
        state.current
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.current = CircuitState::Closed;
        state.failure_count = 0;
        state.last_opened_at = None;
        state.trial_in_flight = false;
        info!(operation = %self.operation, "Circuit breaker reset");
    }

    /// Runs `op` through the breaker, counting every error as a failure.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_counting(op, |_| true).await
    }

    /// Runs `op` through the breaker. Errors for which `counts` returns false
    /// pass through without moving the breaker in either direction.
    pub async fn call_counting<T, F, Fut, C>(&self, op: F, counts: C) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let admission = self.admit()?;
        let mut guard = TrialGuard {
            breaker: self,
            admission,
            settled: false,
        };

        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if counts(e) => self.record_failure(),
            Err(_) => {}
        }
        guard.settled = true;
        if admission == Admission::Trial {
            self.state.lock().trial_in_flight = false;
        }
        result
    }

    fn admit(&self) -> Result<Admission> {
        let mut state = self.state.lock();
        self.maybe_half_open(&mut state);

        match state.current {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen if !state.trial_in_flight => {
                state.trial_in_flight = true;
                debug!(operation = %self.operation, "Circuit breaker admitting trial call");
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen | CircuitState::Open => Err(Error::CircuitOpen {
                operation: self.operation.clone(),
            }),
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        match state.current {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.current = CircuitState::Closed;
                state.failure_count = 0;
                state.last_opened_at = None;
                info!(operation = %self.operation, "Circuit breaker closed after successful trial");
            }
            // A call admitted before the breaker opened; the open window stands.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        match state.current {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.failure_threshold {
                    state.current = CircuitState::Open;
                    state.last_opened_at = Some(Instant::now());
                    warn!(
                        operation = %self.operation,
                        failures = state.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                state.current = CircuitState::Open;
                state.last_opened_at = Some(Instant::now());
                warn!(operation = %self.operation, "Trial call failed, circuit breaker reopened");
            }
            CircuitState::Open => state.failure_count += 1,
        }
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.current != CircuitState::Open {
            return;
        }
        let elapsed = state
            .last_opened_at
            .map_or(true, |opened| opened.elapsed() >= self.timeout);
        if elapsed {
            state.current = CircuitState::HalfOpen;
            state.trial_in_flight = false;
            debug!(operation = %self.operation, "Circuit breaker half-open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn broker_error() -> Error {
        Error::Publish {
            topic: "events.security.alerts".to_string(),
            message: "Leader not available".to_string(),
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(broker_error())
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new("publish", 3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&breaker, &calls).await, Err(Error::Publish { .. })));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result = succeed(&breaker, &calls).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("publish", 3, Duration::from_secs(30));
        let calls = AtomicU32::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker, &calls).await.unwrap_err();
        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("publish", 1, Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker, &calls).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("publish", 1, Duration::from_secs(10));
        let calls = AtomicU32::new(0);

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(11)).await;

        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Timeout restarts from the reopen.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            succeed(&breaker, &calls).await,
            Err(Error::CircuitOpen { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let breaker = Arc::new(CircuitBreaker::new("publish", 1, Duration::from_secs(1)));
        let calls = Arc::new(AtomicU32::new(0));

        fail(&breaker, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(2)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let breaker = breaker.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                breaker
                    .call(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let concurrent = succeed(&breaker, &calls).await;
        assert!(matches!(concurrent, Err(Error::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_uncounted_errors_leave_state_alone() {
        let breaker = CircuitBreaker::new("publish", 1, Duration::from_secs(30));
        let result = breaker
            .call_counting(
                || async {
                    Err::<(), _>(Error::SchemaValidation {
                        schema_id: "alert".to_string(),
                        message: "missing field".to_string(),
                    })
                },
                |e| !e.is_schema_error(),
            )
            .await;
        assert!(matches!(result, Err(Error::SchemaValidation { .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::new("publish", 1, Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        succeed(&breaker, &calls).await.unwrap();
    }
}
