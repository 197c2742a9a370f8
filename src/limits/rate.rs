//! Per-client leaky-bucket rate limiting over a rolling hourly budget.
//!
//! Each call to [`RateLimiter::try_use`] adds one unit of usage for the
//! client key; a background task leaks `maximum / 60` from every key once
//! per minute, so a full budget drains over one hour. Drained keys are
//! removed from the map, bounding memory to currently active clients.
//!
//! The limiter is advisory abuse protection, not exact quota arithmetic:
//! admission is check-then-act per request and two requests racing at the
//! threshold may both be admitted. That is acceptable and expected.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Interval between leak passes.
const LEAK_INTERVAL: Duration = Duration::from_secs(60);

/// Leaky-bucket rate limiter keyed by client.
///
/// One instance per rate-limited endpoint, each with its own hourly
/// `maximum`. State is entirely in-memory and resets on restart.
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
    cancel: CancellationToken,
    leak_task: Mutex<Option<JoinHandle<()>>>,
}

struct RateLimiterInner {
    maximum: f64,
    leak_per_minute: f64,
    usage: Mutex<HashMap<String, f64>>,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_per_hour` admissions per key.
    ///
    /// The leak task is not running yet; call [`start`](Self::start) from
    /// within a tokio runtime once the service is wired up.
    #[must_use]
    pub fn new(max_per_hour: f64) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                maximum: max_per_hour,
                leak_per_minute: max_per_hour / 60.0,
                usage: Mutex::new(HashMap::new()),
            }),
            cancel: CancellationToken::new(),
            leak_task: Mutex::new(None),
        }
    }

    /// Attempts to admit one request for `key`.
    ///
    /// Admits iff the pre-increment usage is below the maximum; rejected
    /// calls do not increment.
    pub fn try_use(&self, key: &str) -> bool {
        let mut usage = self.inner.usage.lock();
        let current = usage.get(key).copied().unwrap_or(0.0);
        if current >= self.inner.maximum {
            return false;
        }
        usage.insert(key.to_string(), current + 1.0);
        true
    }

    /// Spawns the background leak task. Idempotent.
    ///
    /// The task holds only a weak reference, so dropping the limiter stops
    /// it even without an explicit [`shutdown`](Self::shutdown).
    pub fn start(&self) {
        let mut slot = self.leak_task.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.cancel.clone();
        *slot = Some(tokio::spawn(leak_loop(weak, cancel)));
    }

    /// Stops the background leak task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.leak_task.lock().take() {
            task.abort();
        }
    }

    /// Runs one leak pass: decrements every key and drops drained ones.
    ///
    /// Called from the background task every minute; exposed so tests can
    /// drive the clock deterministically.
    pub fn leak_once(&self) {
        self.inner.leak_once();
    }

    /// Number of keys currently tracked (active clients).
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.inner.usage.lock().len()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl RateLimiterInner {
    fn leak_once(&self) {
        let mut usage = self.usage.lock();
        let before = usage.len();
        usage.retain(|_, used| {
            *used -= self.leak_per_minute;
            *used > 0.0
        });
        let dropped = before - usage.len();
        if dropped > 0 {
            debug!(dropped, remaining = usage.len(), "leaked rate limiter keys");
        }
    }
}

async fn leak_loop(inner: Weak<RateLimiterInner>, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + LEAK_INTERVAL, LEAK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.leak_once();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_maximum_then_rejects() {
        let limiter = RateLimiter::new(5.0);
        for _ in 0..5 {
            assert!(limiter.try_use("client"));
        }
        assert!(!limiter.try_use("client"));
        // Rejection did not increment: one leak pass frees exactly one slot.
        limiter.leak_once();
        assert!(limiter.try_use("client"));
        assert!(!limiter.try_use("client"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1.0);
        assert!(limiter.try_use("a"));
        assert!(!limiter.try_use("a"));
        assert!(limiter.try_use("b"));
    }

    #[test]
    fn test_full_budget_restored_after_drain() {
        let limiter = RateLimiter::new(60.0);
        for _ in 0..60 {
            assert!(limiter.try_use("client"));
        }
        assert!(!limiter.try_use("client"));

        // leak rate = maximum / 60 = 1 per minute; 60 passes drain fully
        // and the key is removed from the map.
        for _ in 0..60 {
            limiter.leak_once();
        }
        assert_eq!(limiter.tracked_keys(), 0);
        assert!(limiter.try_use("client"));
    }

    #[test]
    fn test_partial_drain_partially_restores() {
        let limiter = RateLimiter::new(60.0);
        for _ in 0..60 {
            assert!(limiter.try_use("client"));
        }
        for _ in 0..10 {
            limiter.leak_once();
        }
        for _ in 0..10 {
            assert!(limiter.try_use("client"));
        }
        assert!(!limiter.try_use("client"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let limiter = RateLimiter::new(10.0);
        limiter.start();
        limiter.start(); // idempotent
        assert!(limiter.try_use("client"));
        limiter.shutdown();
    }
}
