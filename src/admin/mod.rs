use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::info;

use crate::cluster::registry::ClusterRegistry;
use crate::cluster::ClusterInstance;
use crate::config::MetricsSink;
use crate::metrics;

/// State shared by the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<dyn ClusterRegistry>,
    pub metrics_enabled: bool,
    pub metrics_sink: MetricsSink,
}

pub fn router(state: AdminState, metrics_path: &str) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/list_cluster", get(list_cluster))
        .route("/add_cluster", post(add_cluster));
    if state.metrics_enabled {
        router = router.route(metrics_path, get(metrics_endpoint));
    }
    router.with_state(state)
}

/// Serve the admin surface until the shutdown signal fires.
pub async fn serve(
    port: u16,
    state: AdminState,
    metrics_path: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .context("failed to bind admin listener")?;
    info!(addr = %listener.local_addr().context("admin listener has no address")?, "admin listening");
    let app = router(state, &metrics_path);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("admin server failed")
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_cluster(State(state): State<AdminState>) -> Json<Vec<ClusterInstance>> {
    Json(state.registry.all_cluster_instances())
}

/// Registers a cluster instance and publishes its status. This is also
/// how the control plane feeds the registry in sync mode.
async fn add_cluster(
    State(state): State<AdminState>,
    Json(instance): Json<ClusterInstance>,
) -> impl IntoResponse {
    state.registry.add_cluster(instance.key.clone());
    match state.registry.status_change(instance) {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "failed to store cluster"),
    }
}

async fn metrics_endpoint(State(state): State<AdminState>) -> impl IntoResponse {
    match state.metrics_sink {
        MetricsSink::Prometheus => metrics::gather_text().into_response(),
        MetricsSink::Memory => Json(metrics::gather_json()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::registry::InMemoryClusterRegistry;

    fn state() -> (AdminState, Arc<InMemoryClusterRegistry>) {
        let (registry, _events) = InMemoryClusterRegistry::new();
        (
            AdminState {
                registry: registry.clone(),
                metrics_enabled: true,
                metrics_sink: MetricsSink::Prometheus,
            },
            registry,
        )
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        assert_eq!(healthz().await, "ok");
    }

    #[tokio::test]
    async fn add_then_list_round_trips() {
        let (state, registry) = state();
        let instance = ClusterInstance::local("127.0.0.1", 6379);
        let _ = add_cluster(State(state.clone()), Json(instance.clone())).await;
        assert_eq!(registry.all_cluster_instances().len(), 1);

        let Json(listed) = list_cluster(State(state)).await;
        assert_eq!(listed, vec![instance]);
    }
}
