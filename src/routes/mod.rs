//! Assembles the application's route groups into a single router.

use axum::Router;

use crate::api;
use crate::server::AppState;

pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(api::stats::routes())
        .merge(api::websocket::routes())
}
