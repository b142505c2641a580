use thiserror::Error;

/// A convenience `Result` alias using [`ToolhostError`].
pub type ToolhostResult<T> = Result<T, ToolhostError>;

/// Top-level error type for toolhost.
///
/// Variants map onto the failure modes of a supervised stdio tool server:
/// it can fail to start, go away mid-call, answer too slowly, or answer
/// with a JSON-RPC error of its own.
#[derive(Error, Debug)]
pub enum ToolhostError {
    /// The executable could not be resolved or spawned, or it exited
    /// during the start grace interval.
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// No live connection (or process) exists for the server.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// No correlated response arrived before the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The tool server answered with a JSON-RPC `error` object.
    #[error("Remote tool error {code}: {message}")]
    RemoteTool {
        /// JSON-RPC error code reported by the server.
        code: i64,
        /// Human readable error message reported by the server.
        message: String,
    },

    /// The process exited or was stopped while a request was in flight.
    #[error("Process terminated: {0}")]
    ProcessTerminated(String),

    /// A line looked like a protocol message but could not be decoded.
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// The server id is not known to the registry.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// The inbound request is malformed (e.g. missing tool name).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be parsed or is unsupported.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolhostError {
    /// Whether this failure means the underlying connection is gone and a
    /// fresh connect is worth one attempt.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ToolhostError::NotConnected(_) | ToolhostError::ProcessTerminated(_) | ToolhostError::Io(_)
        )
    }

    /// JSON-RPC error code used when this error is reported over the wire.
    /// Remote tool errors are reported as server errors; their own code
    /// travels in [`ToolhostError::rpc_data`].
    pub fn rpc_code(&self) -> i64 {
        match self {
            ToolhostError::InvalidRequest(_) => -32602,
            _ => -32000,
        }
    }

    /// Extra `data` for the JSON-RPC error object, if any.
    pub fn rpc_data(&self) -> Option<serde_json::Value> {
        match self {
            ToolhostError::RemoteTool { code, .. } => {
                Some(serde_json::json!({ "remoteCode": code }))
            }
            _ => None,
        }
    }

    /// The bare message without the variant prefix.
    pub fn rpc_message(&self) -> String {
        match self {
            ToolhostError::RemoteTool { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
