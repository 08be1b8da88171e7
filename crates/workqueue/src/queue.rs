//! Deduplicating work queue.
//!
//! Items move through three sets:
//! - `dirty`: needs processing (queued, or re-added while processing)
//! - `queue`: dirty and not processing, in FIFO order
//! - `processing`: handed to a worker and not yet `done`

use crate::rate_limiter::RateLimiter;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    shutdown: CancellationToken,
    rate_limiter: Box<dyn RateLimiter<T>>,
}

/// Rate-limited work queue, cheap to clone and share between workers.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
{
    /// Creates a named queue using the given retry policy.
    pub fn new(name: impl Into<String>, rate_limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                rate_limiter,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `item` as needing processing.
    ///
    /// Ignored if the item is already waiting or the queue is shutting down.
    /// If a worker currently holds the item, it is queued again once that
    /// worker calls [`done`](Self::done).
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.inner.name, ?item, "item is being processed, deferring");
            return;
        }

        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next item.
    ///
    /// Returns `None` once the queue is shut down and nothing is left to hand
    /// out. The caller must call [`done`](Self::done) when finished.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Ends processing of `item`, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Adds `item` after `delay` has elapsed.
    ///
    /// Pending delayed adds are dropped on shutdown. Must be called from within
    /// a Tokio runtime when `delay` is non-zero.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = queue.inner.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Adds `item` once the rate limiter allows it.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.rate_limiter.when(&item);
        debug!(
            queue = %self.inner.name,
            ?item,
            delay_ms = delay.as_millis(),
            "requeueing with backoff"
        );
        self.add_after(item, delay);
    }

    /// Clears the retry history of `item`.
    pub fn forget(&self, item: &T) {
        self.inner.rate_limiter.forget(item);
    }

    /// Number of rate-limited re-adds of `item` since it was last forgotten.
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Number of items waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no item is waiting to be handed out.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Stops accepting items and wakes every waiting worker.
    ///
    /// Items already queued are still handed out by `get`.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "work queue shut down");
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
