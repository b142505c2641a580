//! Core types shared across the toolhost crates.
//!
//! This crate holds everything the supervisor, the MCP transport and the
//! HTTP gateway need to agree on without depending on each other.
//!
//! # Main types
//!
//! - [`ToolhostError`]: Unified error enum for all toolhost subsystems.
//! - [`ToolhostResult`]: Convenience alias for `Result<T, ToolhostError>`.
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: JSON-RPC 2.0 wire messages.
//! - [`ToolDescriptor`]: A tool advertised by a server via `tools/list`.
//! - [`ServerConfig`] / [`CommandSpec`]: How to launch a tool server.
//! - [`ServerRegistry`]: Collaborator that resolves a server id to its config.

/// Server launch configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// JSON-RPC and MCP wire types.
pub mod protocol;
/// Server registry and source provisioning.
pub mod registry;

pub use config::{split_command_line, CommandSpec, ServerConfig, TransportType};
pub use error::{ToolhostError, ToolhostResult};
pub use protocol::{
    InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ServerCapabilities, ServerInfo, ToolCallResult, ToolDescriptor, MCP_PROTOCOL_VERSION,
};
pub use registry::{InMemoryServerRegistry, ServerRegistry, SourceProvisioner};
