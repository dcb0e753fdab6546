//! OpenAI-compatible `/v1` surface.

pub mod chat;
pub mod models;

use axum::Router;
use axum::routing::{get, post};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat/completions", post(chat::chat_completions))
        .route("/models", get(models::list_models))
}
