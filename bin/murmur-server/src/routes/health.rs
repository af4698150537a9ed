//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::error::ServerError;
use crate::state::AppState;

/// Register health-check routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat endpoint.
///
/// Returns `{"status": "ok", "version": "...", "orchestrator": {...}}` with
/// HTTP 200. The orchestrator block carries per-status totals, queue depth
/// and worker usage.
pub async fn get_health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    let stats = state.orchestrator.stats().await?;
    Ok(Json(json!({
        "status":  "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "orchestrator": stats,
    })))
}

// ── Tests ──────────────────────────────────────────────────────────────────────
