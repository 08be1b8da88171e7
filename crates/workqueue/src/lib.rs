//! Work Queue
//!
//! A deduplicating, rate-limited queue of reconcile keys for controller
//! worker pools.
//!
//! # Example
//!
//! ```no_run
//! use workqueue::{default_controller_rate_limiter, WorkQueue};
//!
//! # async fn example() {
//! let queue: WorkQueue<String> = WorkQueue::new("pods", default_controller_rate_limiter());
//!
//! queue.add("default/web-0".to_string());
//!
//! while let Some(key) = queue.get().await {
//!     let ok = true; // reconcile `key` here
//!     if ok {
//!         queue.forget(&key);
//!     } else {
//!         queue.add_rate_limited(key.clone());
//!     }
//!     queue.done(&key);
//! }
//! # }
//! ```
//!
//! # Guarantees
//!
//! - **Deduplication**: a key added several times before a worker picks it up
//!   is handed out once
//! - **Exclusive processing**: a key is never handed to two workers at once;
//!   a key re-added while it is being processed is queued again on `done`
//! - **Backoff**: failed keys come back after a per-key exponential delay,
//!   bounded by an overall token bucket

pub mod queue;
pub mod rate_limiter;

pub use queue::WorkQueue;
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
