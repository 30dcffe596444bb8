use axum::Router;
use axum::routing::{get, patch, post};
use tower_http::trace::TraceLayer;

use super::api;
use super::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agent/chat", post(api::chat))
        .route(
            "/api/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route("/api/conversations/{id}", patch(api::update_conversation))
        .route(
            "/api/messages",
            get(api::list_messages).post(api::create_message),
        )
        .route("/api/models", get(api::list_models))
        .route("/api/models/switch", post(api::switch_model))
        .route("/health", get(api::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
