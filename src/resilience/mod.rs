//! Failure isolation for broker calls: a circuit breaker wrapping a bounded
//! retry loop.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;
