//! Token-bucket rate limiting.
//!
//! Tokens refill continuously at `rate` per second up to `burst`. Refill and
//! deduction for one bucket happen in the same critical section, so
//! concurrent callers can never be over-granted.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, RateLimitSettings, Result};

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket protecting one resource (a host's workers, or its dispatch).
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(name: impl Into<String>, settings: RateLimitSettings) -> Self {
        let burst = f64::from(settings.burst);
        Self {
            name: name.into(),
            rate: settings.rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        state.last_refill = now;
    }

    /// Take `n` tokens if available. Never blocks.
    pub fn try_acquire(&self, n: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let n = f64::from(n);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    /// [`try_acquire`](Self::try_acquire) as a `Result`.
    pub fn acquire(&self, n: u32) -> Result<()> {
        if self.try_acquire(n) {
            Ok(())
        } else {
            Err(Error::RateLimited(self.name.clone()))
        }
    }

    /// Time until `n` tokens would be available, `None` if never.
    fn wait_hint(&self, n: u32) -> Option<Duration> {
        let n = f64::from(n);
        if n > self.burst || self.rate <= 0.0 {
            return None;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        let deficit = (n - state.tokens).max(0.0);
        Some(Duration::from_secs_f64(deficit / self.rate))
    }

    /// Wait up to `timeout` for `n` tokens.
    pub async fn acquire_wait(&self, n: u32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire(n) {
                return Ok(());
            }
            let hint = self
                .wait_hint(n)
                .ok_or_else(|| Error::RateLimited(self.name.clone()))?;
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::RateLimited(self.name.clone()));
            }
            let nap = hint
                .max(Duration::from_millis(1))
                .min(deadline.saturating_duration_since(now));
            tokio::time::sleep(nap).await;
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn bucket(rate: f64, burst: u32) -> TokenBucket {
        TokenBucket::new("adt-in", RateLimitSettings { rate, burst })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let b = bucket(10.0, 10);
        for _ in 0..10 {
            assert!(b.try_acquire(1));
        }
        assert!(!b.try_acquire(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_burst() {
        let b = bucket(100.0, 5);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!((b.available() - 5.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_wait() {
        let b = bucket(2.0, 1);
        assert_ok!(b.acquire(1));
        assert!(matches!(b.acquire(1), Err(Error::RateLimited(_))));

        assert_ok!(b.acquire_wait(1, Duration::from_secs(1)).await);
        assert_err!(b.acquire_wait(1, Duration::from_millis(100)).await);
        assert_err!(b.acquire_wait(5, Duration::from_secs(60)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_over_grant_under_contention() {
        let b = Arc::new(bucket(0.001, 50));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                tokio::spawn(async move { (0..20).filter(|_| b.try_acquire(1)).count() })
            })
            .collect();
        let mut granted = 0;
        for task in tasks {
            granted += task.await.unwrap();
        }
        assert_eq!(granted, 50);
    }
}
