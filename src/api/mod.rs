//! HTTP and WebSocket endpoints.

pub mod stats;
pub mod websocket;
