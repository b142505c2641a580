//! HTTP gateway for supervised MCP tool servers.
//!
//! [`McpAdapter`] keeps one MCP client per server id and turns HTTP calls
//! into `tools/list` / `tools/call`; [`GatewayServer`] mounts it on axum.

/// HTTP requests to MCP calls.
pub mod adapter;
/// axum routes.
pub mod server;

pub use adapter::{AdapterResponse, ClientHandle, McpAdapter, ServerOverview};
pub use server::GatewayServer;
