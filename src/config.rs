//! Broker configuration, parsed from the command line.

use std::net::SocketAddr;

use clap::Parser;

/// NT4 publish/subscribe broker.
#[derive(Debug, Clone, Parser)]
#[command(name = "nt4-broker", about = "NetworkTables 4.x broker")]
pub struct Config {
    /// Address to bind the WebSocket listener on.
    #[arg(long, default_value = "127.0.0.1:5810")]
    pub bind: SocketAddr,

    /// Maximum number of simultaneous connections.
    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    /// Capacity of each connection's bounded outbound queue.
    #[arg(long, default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Fallback log level when `RUST_LOG` is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn parse_args() -> Self {
        Config::parse()
    }
}
