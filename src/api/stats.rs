//! Plain HTTP surface: health probe and broker statistics (spec.md §5.3,
//! grounded on the teacher's `/ws/stats` endpoint).

use axum::{extract::State, routing::get, Json, Router};

use crate::server::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
}

async fn health() -> &'static str {
    "OK"
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let connections = state.broker.connection_count().await;
    let topics = state.broker.topic_count().await;
    let by_version = state.broker.protocol_version_counts().await;

    Json(serde_json::json!({
        "connections": connections,
        "topics": topics,
        "connections_by_protocol_version": by_version,
    }))
}
