//! Per-destination circuit breaker.
//!
//! ```text
//!   closed --(failures >= threshold)--> open
//!   open --(elapsed >= open_timeout)--> half-open
//!   half-open --(probe succeeds)--> closed
//!   half-open --(probe fails, or probes exhausted)--> open
//! ```
//!
//! A success while closed decays the failure counter by one instead of
//! resetting it, so isolated failures never add up to a trip.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

use crate::types::{BreakerSettings, Error, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
    half_open_attempts: u32,
}

/// Breaker statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub failures: u32,
    pub half_open_attempts: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding one destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            target: target.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                last_failure: None,
                half_open_attempts: 0,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_attempts = 0;
        tracing::warn!(destination = %self.target, failures = inner.failures, "circuit opened");
    }

    /// Admit or refuse one call.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed = inner
                .opened_at
                .map(|at| at.elapsed())
                .unwrap_or_default();
            if elapsed < self.settings.open_timeout {
                return Err(Error::CircuitOpen(self.target.clone()));
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_attempts = 0;
            tracing::info!(destination = %self.target, "circuit half-open");
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.half_open_attempts >= self.settings.half_open_max_attempts {
                self.open(&mut inner);
                return Err(Error::CircuitOpen(self.target.clone()));
            }
            inner.half_open_attempts += 1;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = inner.failures.saturating_sub(1),
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.half_open_attempts = 0;
                inner.opened_at = None;
                tracing::info!(destination = %self.target, "circuit closed");
            }
            // A call admitted before the trip finished late.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                if inner.failures >= self.settings.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.failures = inner.failures.saturating_add(1);
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Record an outcome, ignoring errors that say nothing about the target.
    pub fn record<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(err) if err.counts_as_failure() => self.record_failure(),
            Err(_) => {}
        }
    }

    /// Run `op` under the breaker. Refused calls never invoke `op`.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire()?;
        let result = op().await;
        self.record(&result);
        result
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            target: self.target.clone(),
            state: inner.state,
            failures: inner.failures,
            half_open_attempts: inner.half_open_attempts,
            last_failure: inner.last_failure,
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// One breaker per destination name, created on first use and kept for the
/// lifetime of the engine.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(target) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.settings))),
        )
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut stats: Vec<BreakerStats> =
            self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}
