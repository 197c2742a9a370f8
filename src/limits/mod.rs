//! Request admission: rate limiting and per-key concurrency control.
//!
//! Both subsystems keep mutable per-key state behind one mutex per
//! instance, inserted lazily and removed when drained, so memory tracks
//! active clients rather than all clients ever seen. State is threaded
//! explicitly through the service; there are no globals.

pub mod rate;
pub mod semaphore;

pub use rate::RateLimiter;
pub use semaphore::{KeyedSemaphore, Permit, SemaphoreError};
