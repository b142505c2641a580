//! Maps HTTP calls onto MCP transports, one client handle per server id.

use axum::http::{Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use toolhost_core::{
    ServerConfig, ServerRegistry, SourceProvisioner, ToolDescriptor, ToolhostError,
    ToolhostResult, TransportType,
};
use toolhost_mcp::{McpTransport, ToolOutput, TransportConfig, TransportState};
use toolhost_supervisor::{ProcessStatus, ProcessSupervisor};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A cached MCP client for one server id.
pub struct ClientHandle {
    /// Identifies this handle in logs; a new handle gets a new id.
    pub id: Uuid,
    /// The transport attached to the server's supervised process.
    pub transport: McpTransport,
    connect_lock: Mutex<()>,
}

/// JSON-RPC shaped reply plus the HTTP status to send it with.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    /// HTTP status to reply with.
    pub status: StatusCode,
    /// `{"jsonrpc":"2.0","id":..,"result"|"error":..}`.
    pub body: Value,
}

impl AdapterResponse {
    fn result(id: Value, result: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body: json!({"jsonrpc": "2.0", "id": id, "result": result}),
        }
    }

    fn error(status: StatusCode, id: Value, code: i64, message: String, data: Option<Value>) -> Self {
        let mut error = json!({"code": code, "message": message});
        if let Some(data) = data {
            error["data"] = data;
        }
        Self {
            status,
            body: json!({"jsonrpc": "2.0", "id": id, "error": error}),
        }
    }

    /// Adapter faults get a non-2xx status; everything the tool server or
    /// the process did wrong is a 200 with a JSON-RPC error.
    pub fn from_error(id: Value, err: &ToolhostError) -> Self {
        let status = match err {
            ToolhostError::UnknownServer(_) => StatusCode::NOT_FOUND,
            ToolhostError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::OK,
        };
        Self::error(status, id, err.rpc_code(), err.rpc_message(), err.rpc_data())
    }
}

/// Row of `GET /servers`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerOverview {
    /// Registry id.
    pub server_id: String,
    /// Supervisor status of the server's process.
    pub status: ProcessStatus,
    /// Pid of the current process record, if any.
    pub pid: Option<u32>,
    /// Whether a cached client is in the `Ready` state.
    pub connected: bool,
    /// Transport declared in the registry.
    pub transport_type: TransportType,
    /// Why the last start failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The HTTP gateway adapter.
///
/// Client handles are created lazily on the first request for a server id.
/// Creation is serialized per id so concurrent first requests share one
/// transport; the creation lock is released before the handshake runs.
pub struct McpAdapter {
    supervisor: Arc<ProcessSupervisor>,
    registry: Arc<dyn ServerRegistry>,
    provisioner: Option<Arc<dyn SourceProvisioner>>,
    settings: TransportConfig,
    clients: RwLock<HashMap<String, Arc<ClientHandle>>>,
    creation_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl McpAdapter {
    /// An adapter with no cached clients.
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        registry: Arc<dyn ServerRegistry>,
        settings: TransportConfig,
    ) -> Self {
        Self {
            supervisor,
            registry,
            provisioner: None,
            settings,
            clients: RwLock::new(HashMap::new()),
            creation_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Consult `provisioner` for servers whose config has no working
    /// directory.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn SourceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// The supervisor that runs every server process.
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Where server configurations are looked up.
    pub fn registry(&self) -> &Arc<dyn ServerRegistry> {
        &self.registry
    }

    /// Registry lookup, stdio check and (if needed) source provisioning.
    pub async fn resolve_config(&self, server_id: &str) -> ToolhostResult<ServerConfig> {
        let mut config = self.registry.get_config(server_id).await?;
        if config.transport_type != TransportType::Stdio {
            return Err(ToolhostError::Config(format!(
                "{server_id}: transport {:?} is not served over stdio",
                config.transport_type
            )));
        }
        if config.cwd.is_none() {
            if let Some(provisioner) = &self.provisioner {
                config.cwd = Some(provisioner.ensure(server_id).await?);
            }
        }
        Ok(config)
    }

    /// The cached client for `server_id`, created if there is none.
    pub async fn get_or_create_client(&self, server_id: &str) -> ToolhostResult<Arc<ClientHandle>> {
        if let Some(handle) = self.clients.read().await.get(server_id) {
            return Ok(Arc::clone(handle));
        }

        let lock = Arc::clone(
            self.creation_locks
                .lock()
                .entry(server_id.to_string())
                .or_default(),
        );
        let _guard = lock.lock().await;

        if let Some(handle) = self.clients.read().await.get(server_id) {
            return Ok(Arc::clone(handle));
        }

        let config = self.resolve_config(server_id).await?;
        let handle = Arc::new(ClientHandle {
            id: Uuid::new_v4(),
            transport: McpTransport::supervised(
                config,
                Arc::clone(&self.supervisor),
                self.settings.clone(),
            ),
            connect_lock: Mutex::new(()),
        });
        self.clients
            .write()
            .await
            .insert(server_id.to_string(), Arc::clone(&handle));
        info!(server_id = %server_id, client_id = %handle.id, "MCP client created");
        Ok(handle)
    }

    /// First contact starts the server (if the supervisor is not running it
    /// already) and attaches. Afterwards the transport re-attaches on its
    /// own and never restarts a stopped server.
    async fn ensure_connected(&self, server_id: &str) -> ToolhostResult<Arc<ClientHandle>> {
        let handle = self.get_or_create_client(server_id).await?;
        let _guard = handle.connect_lock.lock().await;
        if handle.transport.mode().is_some() {
            return Ok(Arc::clone(&handle));
        }

        let process = match self.supervisor.live_process(server_id).await {
            Some(process) => process,
            None => {
                let config = self.resolve_config(server_id).await?;
                self.supervisor.start(&config).await?;
                self.supervisor.live_process(server_id).await.ok_or_else(|| {
                    ToolhostError::NotConnected(format!("{server_id}: exited right after start"))
                })?
            }
        };
        handle.transport.connect(Some(process)).await?;
        Ok(Arc::clone(&handle))
    }

    /// Tools of the server, connecting first if needed.
    pub async fn list_tools(&self, server_id: &str) -> ToolhostResult<Vec<ToolDescriptor>> {
        let handle = self.ensure_connected(server_id).await?;
        handle.transport.list_tools().await
    }

    /// Call one tool, connecting first if needed.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> ToolhostResult<ToolOutput> {
        let handle = self.ensure_connected(server_id).await?;
        handle.transport.call_tool(name, arguments).await
    }

    /// Route one HTTP call to `tools/list` or `tools/call`.
    ///
    /// `path` ending in `tools/list` or `tools/call` selects the method and
    /// `body` holds the call parameters; any other path is a raw JSON-RPC
    /// envelope routed by its `method`. Never fails: errors become JSON-RPC
    /// error bodies.
    pub async fn handle_request(
        &self,
        server_id: &str,
        http_method: &Method,
        path: &str,
        body: Value,
    ) -> AdapterResponse {
        let (rpc_method, id, params) = if path.ends_with("tools/list") {
            ("tools/list".to_string(), Value::Null, body)
        } else if path.ends_with("tools/call") {
            ("tools/call".to_string(), Value::Null, body)
        } else {
            let id = body.get("id").cloned().unwrap_or(Value::Null);
            let method = body.get("method").and_then(Value::as_str).map(str::to_string);
            let params = body.get("params").cloned().unwrap_or(Value::Null);
            match method {
                Some(method) => (method, id, params),
                None => {
                    return AdapterResponse::error(
                        StatusCode::BAD_REQUEST,
                        id,
                        -32600,
                        "Invalid request: missing method".into(),
                        None,
                    )
                }
            }
        };

        debug!(server_id = %server_id, http_method = %http_method, method = %rpc_method, "Gateway request");

        if rpc_method == "tools/call" && http_method != Method::POST {
            return AdapterResponse::error(
                StatusCode::METHOD_NOT_ALLOWED,
                id,
                -32600,
                "tools/call requires POST".into(),
                None,
            );
        }

        let outcome = match rpc_method.as_str() {
            "tools/list" => self
                .list_tools(server_id)
                .await
                .map(|tools| json!({ "tools": tools })),
            "tools/call" => {
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    let err = ToolhostError::InvalidRequest("missing tool name".into());
                    return AdapterResponse::from_error(id, &err);
                };
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                self.call_tool(server_id, name, arguments)
                    .await
                    .and_then(|output| serde_json::to_value(output).map_err(ToolhostError::from))
            }
            other => {
                // Unknown servers still answer 404 before method dispatch.
                if let Err(err) = self.registry.get_config(server_id).await {
                    return AdapterResponse::from_error(id, &err);
                }
                return AdapterResponse::error(
                    StatusCode::OK,
                    id,
                    -32601,
                    format!("Method not found: {other}"),
                    None,
                );
            }
        };

        match outcome {
            Ok(result) => AdapterResponse::result(id, result),
            Err(err) => {
                warn!(server_id = %server_id, method = %rpc_method, error = %err, "Gateway request failed");
                AdapterResponse::from_error(id, &err)
            }
        }
    }

    /// Start the server's process. Returns its pid.
    pub async fn start_server(&self, server_id: &str) -> ToolhostResult<u32> {
        let config = self.resolve_config(server_id).await?;
        self.supervisor.start(&config).await
    }

    /// Stop the server's process. The cached client stays; its next call
    /// fails with `NotConnected` until the server is started again.
    pub async fn stop_server(&self, server_id: &str) -> ToolhostResult<bool> {
        self.registry.get_config(server_id).await?;
        let grace = self.supervisor.config().stop_grace();
        self.supervisor.stop_process(server_id, grace).await
    }

    /// Stop, pause and start the server again. Returns the new pid.
    pub async fn restart_server(&self, server_id: &str) -> ToolhostResult<u32> {
        let config = self.resolve_config(server_id).await?;
        self.supervisor
            .restart_process(server_id, &config.command, config.cwd.as_deref(), &config.env)
            .await
    }

    /// Drop the cached client. The supervised process keeps running.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let handle = self.clients.write().await.remove(server_id);
        self.creation_locks.lock().remove(server_id);
        match handle {
            Some(handle) => {
                handle.transport.disconnect().await;
                info!(server_id = %server_id, client_id = %handle.id, "MCP client removed");
                true
            }
            None => false,
        }
    }

    /// Drop the client and stop the process, discarding its logs.
    pub async fn cleanup(&self, server_id: &str) -> ToolhostResult<bool> {
        self.disconnect(server_id).await;
        self.supervisor.cleanup(server_id).await
    }

    /// Drop every cached client.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.clients.write().await.drain().collect();
        self.creation_locks.lock().clear();
        for (server_id, handle) in handles {
            handle.transport.disconnect().await;
            debug!(server_id = %server_id, "MCP client dropped on shutdown");
        }
    }

    /// State of the cached client, if one exists.
    pub async fn client_state(&self, server_id: &str) -> Option<TransportState> {
        self.clients
            .read()
            .await
            .get(server_id)
            .map(|h| h.transport.state())
    }

    /// Number of cached clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// One row per registered server.
    pub async fn overview(&self) -> ToolhostResult<Vec<ServerOverview>> {
        let mut rows = Vec::new();
        for config in self.registry.list().await? {
            rows.push(self.describe(&config.id, config.transport_type).await);
        }
        Ok(rows)
    }

    /// Status row for one server, or `UnknownServer`.
    pub async fn server_status(&self, server_id: &str) -> ToolhostResult<ServerOverview> {
        let config = self.registry.get_config(server_id).await?;
        Ok(self.describe(server_id, config.transport_type).await)
    }

    async fn describe(&self, server_id: &str, transport_type: TransportType) -> ServerOverview {
        ServerOverview {
            server_id: server_id.to_string(),
            status: self.supervisor.get_status(server_id).await,
            pid: self.supervisor.get_pid(server_id).await,
            connected: self.client_state(server_id).await == Some(TransportState::Ready),
            transport_type,
            last_error: self.supervisor.last_failure(server_id),
        }
    }
}
