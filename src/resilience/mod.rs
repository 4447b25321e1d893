//! Protection layer: circuit breakers and token-bucket rate limiters.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use rate_limiter::TokenBucket;
