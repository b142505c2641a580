//! MCP transport: handshake, request correlation and tool calls over a
//! [`McpStream`].

use crate::content::decode_content;
use crate::stream::{AttachedStream, McpStream, OwnedStream, StreamMode};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use toolhost_core::{
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerConfig,
    ToolCallResult, ToolDescriptor, ToolhostError, ToolhostResult, MCP_PROTOCOL_VERSION,
};
use toolhost_supervisor::{ManagedProcess, PendingReply, ProcessSupervisor};
use tracing::{debug, info, warn};

/// Timeouts and client identity used by every transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Deadline for a single `tools/list` or `tools/call` reply.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Deadline for each handshake step.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Name sent as `clientInfo.name` during `initialize`.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// Grace period before an owned process is force-killed.
    #[serde(default = "default_owned_stop_grace_ms")]
    pub owned_stop_grace_ms: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_client_name() -> String {
    "toolhost".into()
}

fn default_owned_stop_grace_ms() -> u64 {
    5_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            client_name: default_client_name(),
            owned_stop_grace_ms: default_owned_stop_grace_ms(),
        }
    }
}

impl TransportConfig {
    /// Deadline for one request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Deadline for each handshake step.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Grace before an owned process is killed.
    pub fn owned_stop_grace(&self) -> Duration {
        Duration::from_millis(self.owned_stop_grace_ms)
    }
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// No usable connection.
    Disconnected,
    /// Spawning or attaching to a process.
    Connecting,
    /// Running `initialize` and the first `tools/list`.
    Handshaking,
    /// Requests can be sent.
    Ready,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Handshaking => "handshaking",
            TransportState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Decoded result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutput {
    /// Decoded content items, in order.
    pub content: Vec<String>,
    /// Whether the tool reported a failure.
    #[serde(rename = "isError")]
    pub is_error: bool,
}

#[derive(Clone)]
struct Connection {
    stream: Arc<dyn McpStream>,
    generation: u64,
}

/// An MCP client bound to one tool server.
///
/// A transport created with [`McpTransport::supervised`] re-attaches to the
/// supervisor's process when its connection is lost, and never starts one
/// itself: if the supervisor has nothing running, calls fail with
/// [`ToolhostError::NotConnected`] until someone starts the server again.
/// A transport created with [`McpTransport::owned`] respawns its own process.
///
/// A lost connection is re-established at most once per call, and only if
/// the request line had not been written yet. Once a request reached the
/// server it is never replayed.
pub struct McpTransport {
    config: ServerConfig,
    settings: TransportConfig,
    supervisor: Option<Arc<ProcessSupervisor>>,
    state: RwLock<TransportState>,
    mode: RwLock<Option<StreamMode>>,
    connection: RwLock<Option<Connection>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    init: RwLock<Option<InitializeResult>>,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

impl McpTransport {
    /// A transport that spawns and owns its server process.
    pub fn owned(config: ServerConfig, settings: TransportConfig) -> Self {
        Self::build(config, settings, None)
    }

    /// A transport that talks to processes run by `supervisor`.
    pub fn supervised(
        config: ServerConfig,
        supervisor: Arc<ProcessSupervisor>,
        settings: TransportConfig,
    ) -> Self {
        Self::build(config, settings, Some(supervisor))
    }

    fn build(
        config: ServerConfig,
        settings: TransportConfig,
        supervisor: Option<Arc<ProcessSupervisor>>,
    ) -> Self {
        Self {
            config,
            settings,
            supervisor,
            state: RwLock::new(TransportState::Disconnected),
            mode: RwLock::new(None),
            connection: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            init: RwLock::new(None),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Id of the server this transport talks to.
    pub fn server_id(&self) -> &str {
        &self.config.id
    }

    /// Current connection state.
    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    /// Mode of the current (or last) connection.
    pub fn mode(&self) -> Option<StreamMode> {
        *self.mode.read()
    }

    /// The server's `initialize` result, once the handshake has completed.
    pub fn server_info(&self) -> Option<InitializeResult> {
        self.init.read().clone()
    }

    /// Pid of the connected process.
    pub fn pid(&self) -> Option<u32> {
        self.connection.read().as_ref().map(|c| c.stream.pid())
    }

    /// Tools seen during the last handshake or `list_tools`.
    pub fn cached_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().clone()
    }

    /// Connect and run the MCP handshake.
    ///
    /// With `existing`, the transport attaches to that process; without it,
    /// a dedicated process is spawned from the server config.
    pub async fn connect(
        &self,
        existing: Option<Arc<ManagedProcess>>,
    ) -> ToolhostResult<Vec<ToolDescriptor>> {
        let _guard = self.connect_lock.lock().await;
        self.establish(existing).await?;
        Ok(self.cached_tools())
    }

    /// List the server's tools.
    ///
    /// Attached transports answer from the handshake cache; owned ones ask
    /// the server every time.
    pub async fn list_tools(&self) -> ToolhostResult<Vec<ToolDescriptor>> {
        if self.mode() == Some(StreamMode::Attached) {
            if self.live_connection().await.is_none() {
                self.reconnect(None).await?;
            }
            return Ok(self.cached_tools());
        }

        let result = self
            .request("tools/list", None, self.settings.request_timeout())
            .await?;
        let tools = parse_tools(result)?;
        *self.tools.write() = tools.clone();
        Ok(tools)
    }

    /// Call a tool and decode its content into strings.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolhostResult<ToolOutput> {
        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self
            .request("tools/call", Some(params), self.settings.request_timeout())
            .await?;
        let parsed: ToolCallResult = serde_json::from_value(result).map_err(|e| {
            ToolhostError::ProtocolDecode(format!("{}: bad tools/call result: {e}", self.config.id))
        })?;
        debug!(
            server_id = %self.config.id,
            tool = %name,
            is_error = parsed.is_error,
            items = parsed.content.len(),
            "Tool call completed"
        );
        Ok(ToolOutput {
            content: decode_content(&parsed.content),
            is_error: parsed.is_error,
        })
    }

    /// Send a request and wait for its correlated result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ToolhostResult<Value> {
        let mut reconnected = false;
        let mut conn = match self.live_connection().await {
            Some(conn) => conn,
            None => {
                reconnected = true;
                self.reconnect(None).await?
            }
        };

        loop {
            let pending = match self.send(&conn.stream, method, params.clone()).await {
                Ok(pending) => pending,
                Err(e) if e.is_connection_loss() && !reconnected => {
                    warn!(
                        server_id = %self.config.id,
                        method,
                        error = %e,
                        "Send failed, reconnecting once"
                    );
                    reconnected = true;
                    conn = self.reconnect(Some(conn.generation)).await?;
                    continue;
                }
                Err(e) => {
                    if e.is_connection_loss() {
                        self.mark_lost(conn.generation);
                    }
                    return Err(e);
                }
            };

            return match pending.wait(timeout).await.and_then(into_result) {
                Err(e) if e.is_connection_loss() => {
                    self.mark_lost(conn.generation);
                    Err(e)
                }
                other => other,
            };
        }
    }

    /// Drop the connection. Owned processes are stopped; supervised ones
    /// keep running.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        self.teardown().await;
        self.tools.write().clear();
        *self.init.write() = None;
        info!(server_id = %self.config.id, "MCP transport disconnected");
    }

    async fn live_connection(&self) -> Option<Connection> {
        let conn = self.connection.read().clone()?;
        if self.state() == TransportState::Ready && conn.stream.is_alive().await {
            Some(conn)
        } else {
            self.mark_lost(conn.generation);
            None
        }
    }

    /// Re-establish the connection unless another caller already did.
    /// `observed` is the generation the caller saw fail.
    async fn reconnect(&self, observed: Option<u64>) -> ToolhostResult<Connection> {
        let _guard = self.connect_lock.lock().await;

        let current = self.connection.read().clone();
        if let Some(conn) = current {
            if self.state() == TransportState::Ready
                && observed != Some(conn.generation)
                && conn.stream.is_alive().await
            {
                return Ok(conn);
            }
        }

        let existing = match (self.mode(), &self.supervisor) {
            (Some(StreamMode::Owned), _) | (None, None) => None,
            (_, Some(supervisor)) => match supervisor.live_process(&self.config.id).await {
                Some(process) => Some(process),
                None => {
                    *self.state.write() = TransportState::Disconnected;
                    return Err(ToolhostError::NotConnected(format!(
                        "{}: server process is not running",
                        self.config.id
                    )));
                }
            },
            (Some(StreamMode::Attached), None) => {
                *self.state.write() = TransportState::Disconnected;
                return Err(ToolhostError::NotConnected(format!(
                    "{}: attached process is gone",
                    self.config.id
                )));
            }
        };

        info!(server_id = %self.config.id, "Reconnecting MCP transport");
        self.establish(existing).await
    }

    /// Replace the current connection with a fresh one. Caller holds
    /// `connect_lock`.
    async fn establish(&self, existing: Option<Arc<ManagedProcess>>) -> ToolhostResult<Connection> {
        self.teardown().await;
        *self.state.write() = TransportState::Connecting;

        let stream: Arc<dyn McpStream> = match existing {
            Some(process) => {
                *self.mode.write() = Some(StreamMode::Attached);
                if !process.is_alive().await {
                    *self.state.write() = TransportState::Disconnected;
                    return Err(ToolhostError::NotConnected(format!(
                        "{}: process {} has exited",
                        self.config.id,
                        process.pid()
                    )));
                }
                Arc::new(AttachedStream::new(process))
            }
            None => {
                *self.mode.write() = Some(StreamMode::Owned);
                match OwnedStream::spawn(
                    &self.config,
                    self.settings.request_timeout(),
                    self.settings.owned_stop_grace(),
                )
                .await
                {
                    Ok(stream) => Arc::new(stream),
                    Err(e) => {
                        *self.state.write() = TransportState::Disconnected;
                        return Err(e);
                    }
                }
            }
        };

        *self.state.write() = TransportState::Handshaking;
        let (init, tools) = match self.handshake(&stream).await {
            Ok(done) => done,
            Err(e) => {
                warn!(server_id = %self.config.id, error = %e, "MCP handshake failed");
                stream.shutdown().await;
                *self.state.write() = TransportState::Disconnected;
                return Err(e);
            }
        };

        info!(
            server_id = %self.config.id,
            pid = stream.pid(),
            mode = ?stream.mode(),
            protocol_version = %init.protocol_version,
            tools = tools.len(),
            "MCP server initialized"
        );

        let conn = Connection {
            stream,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        *self.init.write() = Some(init);
        *self.tools.write() = tools;
        *self.connection.write() = Some(conn.clone());
        *self.state.write() = TransportState::Ready;
        Ok(conn)
    }

    async fn handshake(
        &self,
        stream: &Arc<dyn McpStream>,
    ) -> ToolhostResult<(InitializeResult, Vec<ToolDescriptor>)> {
        let timeout = self.settings.handshake_timeout();
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.settings.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .send(stream, "initialize", Some(params))
            .await?
            .wait(timeout)
            .await
            .and_then(into_result)?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            ToolhostError::ProtocolDecode(format!("{}: bad initialize result: {e}", self.config.id))
        })?;

        let initialized = JsonRpcNotification::new("notifications/initialized", None).to_line()?;
        stream.send_line(&initialized).await?;

        let result = self
            .send(stream, "tools/list", None)
            .await?
            .wait(timeout)
            .await
            .and_then(into_result)?;
        Ok((init, parse_tools(result)?))
    }

    /// Register a fresh id on the process queue and write the request line.
    async fn send(
        &self,
        stream: &Arc<dyn McpStream>,
        method: &str,
        params: Option<Value>,
    ) -> ToolhostResult<PendingReply> {
        let pending = stream.register()?;
        let id = pending.request_id();
        let line = JsonRpcRequest::new(id, method, params).to_line()?;
        stream.send_line(&line).await?;
        debug!(server_id = %self.config.id, id, method, "Request sent");
        Ok(pending)
    }

    fn mark_lost(&self, generation: u64) {
        let current = self.connection.read().as_ref().map(|c| c.generation);
        if current == Some(generation) {
            let mut state = self.state.write();
            if *state == TransportState::Ready {
                debug!(server_id = %self.config.id, "MCP connection lost");
                *state = TransportState::Disconnected;
            }
        }
    }

    async fn teardown(&self) {
        let previous = self.connection.write().take();
        if let Some(conn) = previous {
            conn.stream.shutdown().await;
        }
        *self.state.write() = TransportState::Disconnected;
    }
}

fn into_result(response: JsonRpcResponse) -> ToolhostResult<Value> {
    if let Some(error) = response.error {
        return Err(ToolhostError::RemoteTool {
            code: error.code,
            message: error.message,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn parse_tools(result: Value) -> ToolhostResult<Vec<ToolDescriptor>> {
    match result.get("tools") {
        Some(tools) => serde_json::from_value(tools.clone())
            .map_err(|e| ToolhostError::ProtocolDecode(format!("bad tools/list result: {e}"))),
        None => Ok(Vec::new()),
    }
}
