//! Resilience patterns wrapping the coordinator client.
//!
//! The coordinator is a single shared dependency: every presence tick, health
//! tick, discovery lookup, and queue operation goes through it. These
//! primitives give that traffic the same shape regardless of transport:
//! - **Retry**: exponential backoff with jitter for coordinator reconnects
//! - **Circuit Breaker**: fail-fast once the coordinator is consistently
//!   unreachable, instead of piling up timeouts behind it
//!
//! HTTP dispatch to downstream service instances deliberately does not use
//! either of these — a failed instance is removed from rotation and the next
//! candidate is tried immediately, with no backoff.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats,
    CircuitOpenError, CircuitState,
};
pub use retry::{AdaptiveRetry, RetryBudget, RetryConfig, RetryError, RetryExecutor, RetryPolicy};
