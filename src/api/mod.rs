pub mod chat;
pub mod middleware;
pub mod state;
pub mod token;

pub use state::AppState;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

pub fn create_router(state: AppState) -> Router {
    // Everything the widget calls sits behind the admission gate; the health
    // probe does not.
    let limited = Router::new()
        .route("/api/token", get(token::issue_token))
        .route("/api/token/revoke", post(token::revoke_token))
        .route("/api/chat", post(chat::send_message))
        .route("/api/chat/history", get(chat::get_history))
        .route("/api/conversations", get(chat::get_recent_conversations))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit,
        ));

    Router::new()
        .route("/api/health", get(health))
        .merge(limited)
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.request_timeout_secs,
        )))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
