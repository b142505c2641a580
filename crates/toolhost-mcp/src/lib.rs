//! MCP client over stdio.
//!
//! [`McpTransport`] runs the MCP handshake and tool calls against a tool
//! server process through one of two [`McpStream`] implementations:
//!
//! - [`OwnedStream`] spawns and owns a dedicated process.
//! - [`AttachedStream`] writes to a process the supervisor already runs and
//!   receives replies through the supervisor's protocol queue.

/// Tool result content decoding.
pub mod content;
/// Owned and attached process streams.
pub mod stream;
/// The MCP client state machine.
pub mod transport;

pub use content::{decode_content, decode_item};
pub use stream::{AttachedStream, McpStream, OwnedStream, StreamMode};
pub use transport::{McpTransport, ToolOutput, TransportConfig, TransportState};
