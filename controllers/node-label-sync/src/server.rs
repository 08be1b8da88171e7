//! Metrics and health check HTTP server.
//!
//! Routes:
//! - GET /metrics - Prometheus text exposition
//! - GET /healthz - Liveness, always `ok` while the process serves requests
//! - GET /readyz - Readiness, `ok` once every registered watch cache has synced

use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cache sync state per resource kind, shared with the health server.
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    synced: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `kind`; the process is not ready until it is marked synced.
    pub fn register(&self, kind: &str) {
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_insert(false);
    }

    pub fn mark_synced(&self, kind: &str) {
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_string(), true);
    }

    /// True when at least one kind is registered and all of them have synced.
    pub fn is_ready(&self) -> bool {
        let synced = self.synced.lock().unwrap_or_else(PoisonError::into_inner);
        !synced.is_empty() && synced.values().all(|ready| *ready)
    }
}

#[derive(Clone)]
struct AppState {
    metrics: Metrics,
    readiness: Readiness,
}

/// Build the axum router serving metrics and health checks.
pub fn router(metrics: Metrics, readiness: Readiness) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(AppState { metrics, readiness })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&state.metrics.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, encoder.format_type().to_string())], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

/// Serves metrics and health checks on `addr` until `stop` fires.
pub async fn serve(
    addr: SocketAddr,
    metrics: Metrics,
    readiness: Readiness,
    stop: CancellationToken,
) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics and health server listening on {}", listener.local_addr()?);

    axum::serve(listener, router(metrics, readiness))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await?;

    info!("Metrics and health server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Outcome;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn get_path(router: Router, path: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_readiness_requires_all_kinds_synced() {
        let readiness = Readiness::new();
        assert!(!readiness.is_ready());

        readiness.register("Pod");
        readiness.register("Node");
        readiness.mark_synced("Pod");
        assert!(!readiness.is_ready());

        readiness.mark_synced("Node");
        assert!(readiness.is_ready());

        // re-registering never un-syncs a kind
        readiness.register("Node");
        assert!(readiness.is_ready());
    }

    #[tokio::test]
    async fn test_healthz() {
        let router = router(Metrics::new().unwrap(), Readiness::new());
        let (status, body) = get_path(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_readyz_follows_cache_sync() {
        let readiness = Readiness::new();
        readiness.register("Pod");
        let metrics = Metrics::new().unwrap();

        let (status, _) = get_path(router(metrics.clone(), readiness.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        readiness.mark_synced("Pod");
        let (status, body) = get_path(router(metrics, readiness), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("Pod", Outcome::Success, Duration::from_millis(2));
        metrics.record_pod_update(Outcome::Success);

        let (status, body) = get_path(router(metrics, Readiness::new()), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("node_label_sync_reconciliations_total"));
        assert!(body.contains("node_label_sync_pod_updates_total"));
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(serve(
            "127.0.0.1:0".parse().unwrap(),
            Metrics::new().unwrap(),
            Readiness::new(),
            stop.clone(),
        ));

        stop.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
