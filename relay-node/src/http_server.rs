//! Health, readiness, status and metrics endpoints.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay_core::Stamp;
use relay_storage::{TaskOwnership, WorkflowStorage};
use serde::Serialize;
use tracing::info;

use crate::scheduler::DISTRIBUTION_TASK;

#[derive(Debug, Clone)]
pub struct AppState {
    pub node_label: String,
    pub storage: WorkflowStorage,
    pub ownership: TaskOwnership,
    pub metrics_enabled: bool,
    pub start_instant: Instant,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub node: String,
    pub uptime_ms: u64,
    pub distribution_leader: Option<String>,
    pub in_flight_epochs: Vec<Stamp>,
    pub last_epoch: Option<LastEpoch>,
}

#[derive(Debug, Serialize)]
pub struct LastEpoch {
    pub stamp: Stamp,
    pub outcome: &'static str,
    pub finished_at_ms: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub async fn serve<S>(addr: SocketAddr, state: AppState, shutdown: S) -> std::io::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

pub async fn health() -> impl IntoResponse {
    "ok"
}

pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.epochs.list_checkpoints() {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime_ms = u64::try_from(state.start_instant.elapsed().as_millis()).unwrap_or(u64::MAX);
    let distribution_leader = state
        .ownership
        .current_holder(DISTRIBUTION_TASK)
        .ok()
        .flatten()
        .map(|l| l.holder_id);
    let in_flight_epochs = state
        .storage
        .epochs
        .list_checkpoints()
        .map(|cps| cps.iter().map(|cp| cp.stamp).collect())
        .unwrap_or_default();
    let last_epoch = state
        .storage
        .epochs
        .list_results(1)
        .ok()
        .and_then(|r| r.into_iter().next())
        .map(|r| LastEpoch {
            stamp: r.stamp,
            outcome: r.outcome(),
            finished_at_ms: r.finished_at_ms,
        });
    Json(StatusResponse {
        service: "relay-node",
        version: env!("CARGO_PKG_VERSION"),
        node: state.node_label.clone(),
        uptime_ms,
        distribution_leader,
        in_flight_epochs,
        last_epoch,
    })
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled {
        return (StatusCode::NOT_FOUND, String::new());
    }
    (StatusCode::OK, relay_workflow::metrics::gather_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{EpochCheckpoint, Score};

    fn state(metrics_enabled: bool) -> AppState {
        let storage = WorkflowStorage::open_temporary().unwrap();
        AppState {
            node_label: "relay-node-test".to_string(),
            ownership: storage.task_ownership("relay-node-test", 30_000).unwrap(),
            storage,
            metrics_enabled,
            start_instant: Instant::now(),
        }
    }

    #[tokio::test]
    async fn health_and_ready_report_ok() {
        let st = state(true);
        assert_eq!(health().await.into_response().status(), StatusCode::OK);
        assert_eq!(
            ready(State(st)).await.into_response().status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let resp = metrics_handler(State(state(false))).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = metrics_handler(State(state(true))).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_lists_in_flight_epochs() {
        let st = state(true);
        let (cp, _) = EpochCheckpoint::start(
            77,
            vec![Score {
                address: format!("0x{}", "1".repeat(40)),
                fingerprint: "A".repeat(40),
                value: 1,
            }],
            6,
            0,
        );
        st.storage.epochs.save_checkpoint(&cp).unwrap();
        st.ownership.try_acquire(DISTRIBUTION_TASK).unwrap();

        let resp = status(State(st.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["in_flight_epochs"], serde_json::json!([77]));
        assert_eq!(v["distribution_leader"], "relay-node-test");
        assert!(v["last_epoch"].is_null());
    }
}
