//! Model listing, backed by live worker skills.

use axum::Json;
use axum::extract::State;
use chrono::Utc;

use crate::schemas::models::ModelList;
use crate::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList::new(
        state.controller.available_models(),
        Utc::now().timestamp(),
    ))
}
