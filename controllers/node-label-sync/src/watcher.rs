//! Kubernetes resource watchers.
//!
//! One generic [`ResourceController`] is instantiated per resource kind. It
//! turns watch events into reconcile keys on a rate-limited work queue and
//! runs a pool of workers that hand the current cached object to a
//! [`Reconcile`] implementation:
//!
//! ```text
//! watch event -> enqueue key -> worker pops key -> cache lookup -> reconcile
//!                     ^                                               |
//!                     +------------- requeue with backoff <--- error -+
//! ```

use crate::error::{ControllerError, LabelerError};
use crate::metrics::{Metrics, Outcome};
use crate::server::Readiness;
use futures::{Stream, StreamExt};
use kube::Resource;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use workqueue::{default_controller_rate_limiter, WorkQueue};

/// A resource as last observed, together with its deletion marker.
///
/// The marker is set when the object carries a deletion timestamp, or when
/// the watch reported it deleted.
#[derive(Debug, Clone)]
pub struct Observed<K> {
    object: K,
    deleted: bool,
}

impl<K: Resource> Observed<K> {
    /// Wraps an object read from the cache.
    pub fn new(object: K) -> Self {
        let deleted = object.meta().deletion_timestamp.is_some();
        Self { object, deleted }
    }

    /// Wraps the last known state of an object the watch reported deleted.
    pub fn deleted(object: K) -> Self {
        Self { object, deleted: true }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn object(&self) -> &K {
        &self.object
    }
}

/// Reconcile callback invoked by a [`ResourceController`] for its kind.
#[async_trait::async_trait]
pub trait Reconcile<K: Send + 'static>: Send + Sync {
    async fn reconcile(&self, observed: Observed<K>) -> Result<(), LabelerError>;
}

/// Reconcile key of an object: `namespace/name`, or `name` for cluster-scoped objects.
pub fn key_for<K: Resource>(obj: &K) -> Option<String> {
    let meta = obj.meta();
    let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
    Some(match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    })
}

/// Splits a reconcile key into optional namespace and name.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str), ControllerError> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok((None, name)),
        (Some(namespace), Some(name), None) if !namespace.is_empty() && !name.is_empty() => {
            Ok((Some(namespace), name))
        }
        _ => Err(ControllerError::InvalidKey(key.to_string())),
    }
}

/// Objects cached before a relist started, and the keys the relist has returned so far.
struct Relist<K> {
    previous: HashMap<String, K>,
    seen: HashSet<String>,
}

/// Watch-driven work queue and worker pool for one resource kind.
pub struct ResourceController<K, H>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: String,
    store: Store<K>,
    queue: WorkQueue<String>,
    tombstones: Mutex<HashMap<String, K>>,
    relist: Mutex<Option<Relist<K>>>,
    handler: Arc<H>,
    metrics: Metrics,
    readiness: Readiness,
    resync_period: Option<Duration>,
}

impl<K, H> ResourceController<K, H>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
    H: Reconcile<K> + 'static,
{
    /// Creates a controller reading objects from `store` and reconciling them with `handler`.
    pub fn new(store: Store<K>, handler: Arc<H>, metrics: Metrics, readiness: Readiness) -> Self {
        let kind = K::kind(&K::DynamicType::default()).into_owned();
        readiness.register(&kind);
        Self {
            queue: WorkQueue::new(kind.to_lowercase(), default_controller_rate_limiter()),
            kind,
            store,
            tombstones: Mutex::new(HashMap::new()),
            relist: Mutex::new(None),
            handler,
            metrics,
            readiness,
            resync_period: None,
        }
    }

    /// Re-enqueues every cached object each `period` once running.
    #[must_use]
    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    #[cfg(test)]
    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    fn tombstones(&self) -> MutexGuard<'_, HashMap<String, K>> {
        self.tombstones.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn relist(&self) -> MutexGuard<'_, Option<Relist<K>>> {
        self.relist.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_queue_depth(&self) {
        self.metrics.set_queue_depth(&self.kind, self.queue.len());
    }

    /// Adds the object's key to the queue.
    pub fn enqueue(&self, obj: &K) {
        match key_for(obj) {
            Some(key) => {
                self.queue.add(key);
                self.update_queue_depth();
            }
            None => error!("Couldn't get key for {} object {:?}", self.kind, obj),
        }
    }

    /// Queues `key` with the last known state of a deleted object.
    fn enqueue_deleted(&self, key: String, obj: K) {
        self.tombstones().insert(key.clone(), obj);
        self.queue.add(key);
        self.update_queue_depth();
    }

    /// Translates one watch event into queue entries.
    ///
    /// Expects the event to have been applied to the store already, as
    /// `reflector` does. A relist swaps the store contents only once it
    /// completes, so objects cached at `Init` but not returned before
    /// `InitDone` were deleted while the watch was down and are queued as
    /// deletes.
    pub fn handle_event(&self, event: &watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj) => {
                debug!("Adding/updating {} {:?}", self.kind, obj.meta().name);
                self.enqueue(obj);
            }
            watcher::Event::InitApply(obj) => {
                debug!("Adding/updating {} {:?}", self.kind, obj.meta().name);
                if let (Some(relist), Some(key)) = (self.relist().as_mut(), key_for(obj)) {
                    relist.seen.insert(key);
                }
                self.enqueue(obj);
            }
            watcher::Event::Delete(obj) => {
                debug!("Deleting {} {:?}", self.kind, obj.meta().name);
                match key_for(obj) {
                    Some(key) => self.enqueue_deleted(key, obj.clone()),
                    None => error!("Couldn't get key for deleted {} object {:?}", self.kind, obj),
                }
            }
            watcher::Event::Init => {
                debug!("{} watch (re)listing", self.kind);
                let previous = self
                    .store
                    .state()
                    .into_iter()
                    .filter_map(|obj| key_for(&*obj).map(|key| (key, K::clone(&obj))))
                    .collect();
                *self.relist() = Some(Relist {
                    previous,
                    seen: HashSet::new(),
                });
            }
            watcher::Event::InitDone => {
                info!("{} watch listing complete", self.kind);
                let Some(relist) = self.relist().take() else {
                    return;
                };
                for (key, obj) in relist.previous {
                    if !relist.seen.contains(&key) {
                        debug!("{} {} vanished while the watch was down", self.kind, key);
                        self.enqueue_deleted(key, obj);
                    }
                }
            }
        }
    }

    /// Feeds events from `stream` into the queue until `stop` fires.
    ///
    /// Stream errors are logged and the stream is polled again; the stream
    /// ending is an error since the cache would go stale.
    pub async fn watch<S>(&self, stream: S, stop: CancellationToken) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
    {
        info!("Starting {} watcher", self.kind);
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(()),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => self.handle_event(&event),
                Some(Err(e)) => warn!("{} watch error, retrying: {}", self.kind, e),
                None => {
                    return Err(ControllerError::Watch(format!("{} watch stream ended", self.kind)));
                }
            }
        }
    }

    /// Waits for the initial cache sync, then runs `workers` worker tasks until `stop` fires.
    ///
    /// Returns an error without starting workers if the cache cannot sync,
    /// and an error if a worker dies while running.
    pub async fn run(self: Arc<Self>, workers: usize, stop: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting {} controller", self.kind);

        let synced = tokio::select! {
            biased;
            () = stop.cancelled() => false,
            ready = self.store.wait_until_ready() => ready.is_ok(),
        };
        if !synced {
            self.queue.shut_down();
            error!("{} cache failed to sync", self.kind);
            return Err(ControllerError::CacheSync { kind: self.kind.clone() });
        }
        self.readiness.mark_synced(&self.kind);
        info!("{} cache synced, starting {} workers", self.kind, workers);

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            tasks.spawn(async move { this.run_worker(id, stop).await });
        }
        if let Some(period) = self.resync_period {
            let this = Arc::clone(&self);
            let stop = stop.clone();
            tasks.spawn(async move { this.resync(period, stop).await });
        }

        let result = tokio::select! {
            biased;
            () = stop.cancelled() => Ok(()),
            Some(joined) = tasks.join_next() => {
                let reason = match joined {
                    Ok(()) => format!("{} worker", self.kind),
                    Err(e) => format!("{} worker ({e})", self.kind),
                };
                Err(ControllerError::Stopped(reason))
            }
        };

        self.queue.shut_down();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("{} worker panicked: {}", self.kind, e);
            }
        }
        info!("Shutting down {} controller", self.kind);
        result
    }

    async fn run_worker(&self, id: usize, stop: CancellationToken) {
        debug!("Starting {} worker {}", self.kind, id);
        loop {
            let key = tokio::select! {
                biased;
                () = stop.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process_next_work_item(key).await;
        }
        debug!("{} worker {} stopped", self.kind, id);
    }

    async fn resync(&self, period: Duration, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        // first tick completes immediately; the initial listing already enqueued everything
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let objects = self.store.state();
            debug!("Resyncing {} {} objects", objects.len(), self.kind);
            for obj in &objects {
                self.enqueue(obj);
            }
        }
    }

    /// Syncs one key and decides between forgetting and requeueing it.
    pub async fn process_next_work_item(&self, key: String) {
        let started = Instant::now();
        let outcome = match self.sync(&key).await {
            Ok(()) => {
                self.queue.forget(&key);
                Outcome::Success
            }
            Err(ControllerError::InvalidKey(invalid)) => {
                // retrying can never succeed
                error!("Dropping invalid {} resource key: {:?}", self.kind, invalid);
                self.queue.forget(&key);
                Outcome::Dropped
            }
            Err(e) => {
                self.queue.add_rate_limited(key.clone());
                warn!("Sync {} failed (retry {}) with: {}", key, self.queue.num_requeues(&key), e);
                Outcome::Error
            }
        };
        self.queue.done(&key);

        self.metrics.record_reconcile(&self.kind, outcome, started.elapsed());
        self.update_queue_depth();
    }

    /// Hands the current state of `key` to the handler.
    ///
    /// A key missing from the cache is a no-op unless a watch delete was
    /// observed for it, in which case the last known state is handed over
    /// with the deletion marker set.
    pub async fn sync(&self, key: &str) -> Result<(), ControllerError> {
        let started = Instant::now();
        let (namespace, name) = split_key(key)?;
        let object_ref = match namespace {
            Some(namespace) => ObjectRef::<K>::new(name).within(namespace),
            None => ObjectRef::<K>::new(name),
        };

        let tombstone = self.tombstones().remove(key);
        let observed = match (self.store.get(&object_ref), tombstone) {
            // operate on a copy so the shared cache is never mutated
            (Some(cached), _) => Observed::new(K::clone(&cached)),
            (None, Some(last_known)) => Observed::deleted(last_known),
            (None, None) => {
                debug!("{} has been deleted: {}", self.kind, key);
                return Ok(());
            }
        };

        let result = self
            .handler
            .reconcile(observed)
            .await
            .map_err(|source| ControllerError::Sync {
                kind: self.kind.clone(),
                key: key.to_string(),
                source,
            });
        debug!("Finished syncing {} {:?} ({:?})", self.kind, key, started.elapsed());
        result
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }
}
