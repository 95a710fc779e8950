//! NT4 broker
//!
//! Implements the NetworkTables 4.x publish/subscribe wire protocol over
//! WebSocket: a JSON control channel for publish/subscribe/announce
//! bookkeeping and a MessagePack binary channel for values and time sync.
//!
//! ## Dependencies
//! - Axum: WebSocket upgrade and HTTP routing
//! - Tokio: async runtime
//! - rmpv / rmp-serde: MessagePack value codec
//! - Tracing: structured logging
//! - Clap: command-line configuration
//!
//! ## Quick start
//! Run: `nt4-broker --bind 127.0.0.1:5810`
//! Connect with subprotocol `v4.1.networktables.first.wpi.edu` or
//! `networktables.first.wpi.edu` at `ws://127.0.0.1:5810/nt/4.1`.

mod api;
mod broker;
mod codec;
mod config;
mod error;
mod routes;
mod server;
mod value;

use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    server::run(config).await
}
