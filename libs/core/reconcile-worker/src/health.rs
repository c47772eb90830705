//! Health check handlers for controller processes.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), delegated to a [`ReadinessProbe`]
//! - Prometheus metrics (`/metrics`)

use async_trait::async_trait;
use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::metrics;

/// Dependency check behind the readiness endpoint (e.g. the backing store).
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Name reported under `checks` in the readiness response.
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<(), String>;
}

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub app_name: String,
    pub app_version: String,
    pub probe: Arc<dyn ReadinessProbe>,
}

impl HealthState {
    pub fn new(
        probe: Arc<dyn ReadinessProbe>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            probe,
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler. OK whenever the process is serving HTTP.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let mut checks = serde_json::Map::new();

    match state.probe.check().await {
        Ok(()) => {
            checks.insert(state.probe.name().to_string(), json!("ok"));
            Ok((
                StatusCode::OK,
                Json(json!({ "status": "ready", "checks": checks })),
            ))
        }
        Err(e) => {
            checks.insert(state.probe.name().to_string(), json!(format!("error: {}", e)));
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "not_ready", "checks": checks })),
            ))
        }
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with `/health`, `/healthz`, `/ready`, `/readyz` and `/metrics`.
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
