//! WebSocket client library
//!
//! A reusable WebSocket client with automatic reconnection,
//! subscription replay on reconnect, ping/pong keepalive and
//! configurable backoff.

mod client;
mod types;

pub use client::WsClient;
pub use types::{WsConfig, WsError, WsMessage};
