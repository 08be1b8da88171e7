//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watch caches,
//! the two resource controllers and the labeler together, and supervises the
//! resulting background tasks:
//! - Pod watcher and Pod controller: reconcile pods through `Labeler::handle_pod`
//! - Node watcher and Node controller: reconcile nodes through `Labeler::handle_node`
//! - Metrics server: `/metrics`, `/healthz`, `/readyz`
//!
//! Any of these tasks exiting while the process should still be running
//! stops the others and makes [`Controller::run`] return an error.

use crate::config::Config;
use crate::error::ControllerError;
use crate::labeler::Labeler;
use crate::metrics::Metrics;
use crate::server::{self, Readiness};
use crate::watcher::ResourceController;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, reflector, watcher};
use pod_client::KubePodClient;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of a supervised task, tagged with the task's name.
pub type TaskResult = (&'static str, Result<(), ControllerError>);

/// Main controller for node label propagation.
pub struct Controller {
    stop: CancellationToken,
    tasks: JoinSet<TaskResult>,
}

/// Spawns `task` on `tasks` under `name`.
pub fn spawn_named<F>(tasks: &mut JoinSet<TaskResult>, name: &'static str, task: F)
where
    F: Future<Output = Result<(), ControllerError>> + Send + 'static,
{
    tasks.spawn(async move { (name, task.await) });
}

impl Controller {
    /// Connects to the cluster and starts every background task.
    pub async fn new(config: &Config) -> Result<Self, ControllerError> {
        info!("Initializing Node Label Sync Controller");

        let mut kube_config = kube::Config::infer().await?;
        if let Some(url) = &config.master_url {
            kube_config.cluster_url = url.parse().map_err(|e| {
                ControllerError::InvalidConfig(format!("KUBE_MASTER_URL `{url}` is not a valid URL: {e}"))
            })?;
        }
        info!("Using API server {}", kube_config.cluster_url);
        let kube_client = Client::try_from(kube_config)?;

        let metrics = Metrics::new()?;
        let readiness = Readiness::new();
        let labeler = Arc::new(Labeler::new(
            config.labels.clone(),
            Box::new(KubePodClient::new(kube_client.clone())),
            metrics.clone(),
        ));

        let (pod_store, pod_writer) = reflector::store::<Pod>();
        let pod_controller = Arc::new(
            ResourceController::new(pod_store, Arc::clone(&labeler), metrics.clone(), readiness.clone())
                .with_resync(config.resync_period),
        );
        let pod_events = reflector(
            pod_writer,
            watcher(Api::<Pod>::all(kube_client.clone()), watcher::Config::default()).default_backoff(),
        );

        let (node_store, node_writer) = reflector::store::<Node>();
        let node_controller = Arc::new(
            ResourceController::new(node_store, Arc::clone(&labeler), metrics.clone(), readiness.clone())
                .with_resync(config.resync_period),
        );
        let node_events = reflector(
            node_writer,
            watcher(Api::<Node>::all(kube_client), watcher::Config::default()).default_backoff(),
        );

        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Start all watchers and worker pools in background tasks
        {
            let controller = Arc::clone(&pod_controller);
            let stop = stop.clone();
            spawn_named(&mut tasks, "Pod watcher", async move { controller.watch(pod_events, stop).await });
        }
        spawn_named(&mut tasks, "Pod controller", pod_controller.run(config.workers, stop.clone()));
        {
            let controller = Arc::clone(&node_controller);
            let stop = stop.clone();
            spawn_named(&mut tasks, "Node watcher", async move { controller.watch(node_events, stop).await });
        }
        spawn_named(&mut tasks, "Node controller", node_controller.run(config.workers, stop.clone()));
        spawn_named(
            &mut tasks,
            "Metrics server",
            server::serve(config.metrics_addr, metrics, readiness, stop.clone()),
        );

        Ok(Self { stop, tasks })
    }

    /// Runs until a shutdown signal arrives or a background task exits.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Node Label Sync Controller running");
        supervise(self.tasks, self.stop, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Waits for `shutdown` or the first task to exit, then stops and drains all tasks.
///
/// Returns `Ok` only when `shutdown` completed first. A task exiting on its
/// own is an error, since every task is meant to run for the process lifetime.
pub async fn supervise<F>(
    mut tasks: JoinSet<TaskResult>,
    stop: CancellationToken,
    shutdown: F,
) -> Result<(), ControllerError>
where
    F: Future<Output = ()>,
{
    let result = tokio::select! {
        () = shutdown => {
            info!("Shutdown signal received, stopping");
            Ok(())
        }
        Some(joined) = tasks.join_next() => match joined {
            Ok((name, Ok(()))) => {
                error!("{} exited unexpectedly", name);
                Err(ControllerError::Stopped(name.to_string()))
            }
            Ok((name, Err(e))) => {
                error!("{} failed: {}", name, e);
                Err(e)
            }
            Err(e) => {
                error!("Background task panicked: {}", e);
                Err(ControllerError::Stopped(format!("background task ({e})")))
            }
        },
    };

    stop.cancel();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => debug!("{} stopped", name),
            Ok((name, Err(e))) => warn!("{} stopped with error: {}", name, e),
            Err(e) => error!("Background task panicked during shutdown: {}", e),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn wait_for_stop(tasks: &mut JoinSet<TaskResult>, name: &'static str, stop: &CancellationToken) -> Arc<AtomicBool> {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let stop = stop.clone();
        spawn_named(tasks, name, async move {
            stop.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        stopped
    }

    fn explode() -> Result<(), ControllerError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_tasks_gracefully() {
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let stopped = wait_for_stop(&mut tasks, "worker", &stop);

        let result = supervise(tasks, stop.clone(), async {}).await;

        assert!(result.is_ok());
        assert!(stop.is_cancelled());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_task_exit_is_fatal() {
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let stopped = wait_for_stop(&mut tasks, "Node controller", &stop);
        spawn_named(&mut tasks, "Pod controller", async { Ok(()) });

        let err = supervise(tasks, stop, std::future::pending()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Stopped(ref name) if name == "Pod controller"));
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_task_error_is_returned() {
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        wait_for_stop(&mut tasks, "Metrics server", &stop);
        spawn_named(&mut tasks, "Pod controller", async {
            Err(ControllerError::CacheSync { kind: "Pod".to_string() })
        });

        let err = tokio::time::timeout(Duration::from_secs(5), supervise(tasks, stop, std::future::pending()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ControllerError::CacheSync { ref kind } if kind == "Pod"));
    }

    #[tokio::test]
    async fn test_task_panic_is_fatal() {
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();
        spawn_named(&mut tasks, "Node watcher", async { explode() });

        let err = supervise(tasks, stop, std::future::pending()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Stopped(_)));
    }
}
