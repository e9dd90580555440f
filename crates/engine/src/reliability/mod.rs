//! Admission gates
//!
//! This module provides:
//! - [`TokenBucket`] - Lazily refilled rate limiter
//! - [`CircuitBreaker`] - Timer-free circuit breaker with single-trial half-open state
//! - [`CircuitBreakerConfig`] - Circuit breaker configuration

mod circuit_breaker;
mod token_bucket;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitPermit, CircuitState,
};
pub use token_bucket::{TokenBucket, TokenBucketError};
