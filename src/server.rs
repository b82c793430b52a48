//! Health and metrics endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus_client::registry::Registry;
use serde::Serialize;

use crate::storage::IndexStorageClient;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub disk: CheckResult,
    pub storage: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// State and router
// ---------------------------------------------------------------------------

/// State shared by the admin handlers.
pub struct ServerState {
    pub registry: Registry,
    pub storage: Arc<dyn IndexStorageClient>,
    pub cache_dir: PathBuf,
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<ServerState>>) -> Response {
    let disk = check_disk(&state.cache_dir);
    let storage = check_storage(state.storage.as_ref()).await;

    let healthy = disk.ok && storage.ok;
    let status = if healthy {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(HealthResponse {
            status,
            checks: HealthChecks { disk, storage },
        }),
    )
        .into_response()
}

/// `GET /metrics`
///
/// Returns Prometheus metrics in OpenMetrics text format.
async fn handle_metrics(State(state): State<Arc<ServerState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.registry) {
        Ok(()) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

fn check_disk(cache_dir: &PathBuf) -> CheckResult {
    match cache_dir.metadata() {
        Ok(metadata) if metadata.is_dir() => CheckResult::healthy(),
        Ok(_) => CheckResult::unhealthy(format!("{} is not a directory", cache_dir.display())),
        Err(e) => CheckResult::unhealthy(format!("stat {} failed: {e}", cache_dir.display())),
    }
}

async fn check_storage(storage: &dyn IndexStorageClient) -> CheckResult {
    match storage.list_tables().await {
        Ok(tables) => CheckResult {
            ok: true,
            detail: Some(format!("{} remote tables", tables.len())),
        },
        Err(e) => CheckResult::unhealthy(format!("list tables failed: {e}")),
    }
}
