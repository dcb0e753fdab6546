//! Liveness + cluster snapshot.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let workers = state.controller.worker_registry().snapshot();
    let violations = state
        .qos
        .active_violations()
        .await
        .map(|v| v.len())
        .unwrap_or(0);
    Json(json!({
        "status": "ok",
        "workers": workers.len(),
        "models": state.controller.available_models(),
        "active_slo_violations": violations,
    }))
}
