//! Per-key bounded concurrency with FIFO fairness and bounded queueing.
//!
//! Every distinct key gets its own independent budget of `limit`
//! concurrent slots. Callers over the budget wait in a strict FIFO queue
//! per key; once a key's queue holds `queue_limit` waiters, further
//! arrivals are rejected immediately instead of buffered (load shedding).
//!
//! Wake implies grant: a releasing permit hands its slot directly to the
//! oldest live waiter inside the one mutex guarding the maps, so there is
//! no re-check race between wakeup and acquisition. User futures never run
//! under that mutex, and waiting is a true suspension point (a oneshot
//! await), so queued requests do not occupy worker threads.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors returned by [`KeyedSemaphore`] admission.
#[derive(Error, Debug)]
pub enum SemaphoreError {
    #[error("too many concurrent requests for key '{key}' ({queued} already queued)\nSuggestion: retry after in-flight work drains")]
    TooManyConcurrentRequests { key: String, queued: usize },

    #[error("semaphore closed while waiting on key '{key}'")]
    Closed { key: String },
}

/// Concurrency limiter enforcing an independent budget per logical key.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct KeyedSemaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    limit: usize,
    queue_limit: usize,
    keys: Mutex<HashMap<String, KeyState>>,
}

/// Bookkeeping for one active key. Removed from the map as soon as both
/// the queue and the in-flight count are empty, so the map stays sparse.
#[derive(Default)]
struct KeyState {
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

/// RAII guard for one occupied slot.
///
/// The slot is released when the permit drops, whether the guarded work
/// succeeded or failed. There is no mid-flight cancellation: an abandoned
/// request holds its slot until its work completes.
pub struct Permit {
    inner: Arc<SemaphoreInner>,
    key: String,
    released: bool,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl KeyedSemaphore {
    /// Creates a semaphore with `limit` slots and `queue_limit` queued
    /// waiters per key.
    #[must_use]
    pub fn new(limit: usize, queue_limit: usize) -> Self {
        debug_assert!(limit > 0, "a zero-slot semaphore admits nothing");
        Self {
            inner: Arc::new(SemaphoreInner {
                limit,
                queue_limit,
                keys: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquires a slot for `key`, waiting FIFO behind earlier callers.
    ///
    /// Fails fast with [`SemaphoreError::TooManyConcurrentRequests`] when
    /// the key's queue is full; rejections never consume a slot.
    pub async fn acquire(&self, key: &str) -> Result<Permit, SemaphoreError> {
        let receiver = {
            let mut keys = self.inner.keys.lock();
            let state = keys.entry(key.to_string()).or_default();

            if state.in_flight < self.inner.limit {
                state.in_flight += 1;
                return Ok(Permit::new(&self.inner, key));
            }

            if state.waiters.len() >= self.inner.queue_limit {
                return Err(SemaphoreError::TooManyConcurrentRequests {
                    key: key.to_string(),
                    queued: state.waiters.len(),
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        // Suspension point. The permit arrives through the channel with the
        // slot already accounted to us.
        receiver.await.map_err(|_| SemaphoreError::Closed {
            key: key.to_string(),
        })
    }

    /// Runs `work` under a slot for `key`, releasing it on completion.
    pub async fn run<T>(
        &self,
        key: &str,
        work: impl Future<Output = T>,
    ) -> Result<T, SemaphoreError> {
        let _permit = self.acquire(key).await?;
        Ok(work.await)
    }

    /// In-flight count for `key` (primarily for tests and introspection).
    #[must_use]
    pub fn in_flight(&self, key: &str) -> usize {
        self.inner
            .keys
            .lock()
            .get(key)
            .map(|state| state.in_flight)
            .unwrap_or(0)
    }

    /// Number of keys currently holding any bookkeeping.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.inner.keys.lock().len()
    }
}

impl Permit {
    fn new(inner: &Arc<SemaphoreInner>, key: &str) -> Self {
        Self {
            inner: Arc::clone(inner),
            key: key.to_string(),
            released: false,
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        SemaphoreInner::release(&self.inner, &self.key);
    }
}

impl SemaphoreInner {
    /// Releases one slot for `key`: hands it to the oldest live waiter, or
    /// frees it and prunes empty bookkeeping.
    fn release(inner: &Arc<Self>, key: &str) {
        let mut keys = inner.keys.lock();
        let Some(state) = keys.get_mut(key) else {
            return;
        };

        while let Some(waiter) = state.waiters.pop_front() {
            let permit = Permit::new(inner, key);
            match waiter.send(permit) {
                // Slot handed over; in-flight count is unchanged.
                Ok(()) => return,
                // The waiter gave up before being served; reclaim the
                // permit without re-entering release and try the next one.
                Err(mut unsent) => unsent.released = true,
            }
        }

        state.in_flight -= 1;
        if state.in_flight == 0 && state.waiters.is_empty() {
            keys.remove(key);
        }
    }
}
