// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Read-only:
//   GET /api/v1/health  — liveness probe (used by the `health` CLI command)
//   GET /api/v1/state   — full worker snapshot
//
// CORS is configured permissively; the endpoint binds to localhost by
// default (`WORKER_BIND_ADDR`).
// =============================================================================

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::clock::Clock;
use crate::error::{Result, TradeError};
use crate::worker::WorkerShared;

#[derive(Clone)]
struct ApiState {
    shared: Arc<WorkerShared>,
    clock: Arc<dyn Clock>,
}

/// Build the router with CORS middleware and shared state.
pub fn router(shared: Arc<WorkerShared>, clock: Arc<dyn Clock>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .layer(cors)
        .with_state(ApiState { shared, clock })
}

/// Bind and serve until shutdown is signalled.
pub async fn serve(
    bind_addr: &str,
    shared: Arc<WorkerShared>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(shared, clock);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| TradeError::Config(format!("failed to bind {bind_addr}: {e}")))?;
    info!(addr = bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopped| *stopped).await;
        })
        .await
        .map_err(|e| TradeError::Config(format!("API server failed: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    worker_id: String,
    worker_status: String,
    server_time: i64,
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        worker_id: state.shared.worker_id.clone(),
        worker_status: state.shared.status.read().to_string(),
        server_time: state.clock.now().timestamp_millis(),
    };
    Json(resp)
}

async fn full_state(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.shared.snapshot(state.clock.now()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::WorkerStatus;
    use chrono::{TimeZone, Utc};
    use tower::ServiceExt;

    fn api() -> Router {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap(),
        ));
        let shared = Arc::new(WorkerShared::new("w1", clock.now()));
        *shared.status.write() = WorkerStatus::Scanning;
        router(shared, clock)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = api()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["worker_id"], "w1");
        assert_eq!(body["worker_status"], "SCANNING");
    }

    #[tokio::test]
    async fn state_returns_snapshot() {
        let response = api()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/state")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["worker_id"], "w1");
        assert_eq!(body["status"], "SCANNING");
    }
}
