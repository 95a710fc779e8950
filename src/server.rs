//! Application shell: shared state, router assembly, and the run loop.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::Broker;
use crate::config::Config;
use crate::routes;

/// Shared application state, cloned into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub max_connections: usize,
}

pub fn build_router(state: AppState) -> Router {
    routes::create_routes()
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Builds the broker, starts its coalescing sweep task, binds the listener,
/// and serves until interrupted.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(Broker::new(config.queue_capacity));
    broker.clone().spawn_sweep_task(Duration::from_millis(20));

    let state = AppState {
        broker,
        max_connections: config.max_connections,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, "NT4 broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
