//! The byte-level side of a transport: where lines go and where replies
//! come from.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use toolhost_core::{ServerConfig, ToolhostResult};
use toolhost_supervisor::{LogBuffer, ManagedProcess, PendingReply, ProcessStatus, ProtocolQueue};
use tracing::{debug, info};

/// Unclaimed protocol lines kept per owned process.
const OWNED_QUEUE_CAPACITY: usize = 1000;
/// Log lines kept per owned process.
const OWNED_LOG_CAPACITY: usize = 1000;

/// How a transport reaches its server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// The transport spawned the process and kills it on shutdown.
    Owned,
    /// The supervisor owns the process; the transport only borrows it.
    Attached,
}

/// A line-oriented duplex channel to one server process.
///
/// Replies are never read directly: a request registers its id on the
/// process queue first, writes its line, and then waits on the returned
/// [`PendingReply`].
#[async_trait]
pub trait McpStream: Send + Sync {
    /// Whether the stream owns its process.
    fn mode(&self) -> StreamMode;

    /// OS process id of the server.
    fn pid(&self) -> u32;

    /// Allocate a request id that is unique on this process and register
    /// interest in its reply.
    fn register(&self) -> ToolhostResult<PendingReply>;

    /// Write one request or notification line.
    async fn send_line(&self, line: &str) -> ToolhostResult<()>;

    /// Whether the process is still running and its output still open.
    async fn is_alive(&self) -> bool;

    /// Release the stream. Only owned streams stop their process.
    async fn shutdown(&self);
}

/// A process spawned for, and owned by, a single transport.
pub struct OwnedStream {
    process: Arc<ManagedProcess>,
    stop_grace: Duration,
}

impl OwnedStream {
    /// Spawn the server described by `config` with a private queue and log.
    pub async fn spawn(
        config: &ServerConfig,
        message_ttl: Duration,
        stop_grace: Duration,
    ) -> ToolhostResult<Self> {
        let queue = ProtocolQueue::new(config.id.clone(), OWNED_QUEUE_CAPACITY, message_ttl);
        let logs = Arc::new(LogBuffer::new(OWNED_LOG_CAPACITY));
        let process = ManagedProcess::spawn(
            &config.id,
            &config.command,
            config.cwd.as_deref(),
            &config.env,
            queue,
            logs,
        )
        .await?;
        process.set_status(ProcessStatus::Running);
        info!(server_id = %config.id, pid = process.pid(), "Spawned owned MCP server");
        Ok(Self { process, stop_grace })
    }

    /// Non-protocol output of the owned process.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        self.process.logs()
    }
}

#[async_trait]
impl McpStream for OwnedStream {
    fn mode(&self) -> StreamMode {
        StreamMode::Owned
    }

    fn pid(&self) -> u32 {
        self.process.pid()
    }

    fn register(&self) -> ToolhostResult<PendingReply> {
        self.process.queue().register_next()
    }

    async fn send_line(&self, line: &str) -> ToolhostResult<()> {
        self.process.send_line(line).await
    }

    async fn is_alive(&self) -> bool {
        !self.process.queue().is_closed() && self.process.is_alive().await
    }

    async fn shutdown(&self) {
        let graceful = self.process.terminate(self.stop_grace).await;
        debug!(server_id = %self.process.server_id(), graceful, "Owned MCP server stopped");
    }
}

/// A process the supervisor runs; the supervisor's reader task demultiplexes
/// its output and resolves our pending replies.
pub struct AttachedStream {
    process: Arc<ManagedProcess>,
}

impl AttachedStream {
    /// Borrow a supervised process.
    pub fn new(process: Arc<ManagedProcess>) -> Self {
        Self { process }
    }

    /// The supervised process this stream writes to.
    pub fn process(&self) -> &Arc<ManagedProcess> {
        &self.process
    }
}

#[async_trait]
impl McpStream for AttachedStream {
    fn mode(&self) -> StreamMode {
        StreamMode::Attached
    }

    fn pid(&self) -> u32 {
        self.process.pid()
    }

    fn register(&self) -> ToolhostResult<PendingReply> {
        self.process.queue().register_next()
    }

    async fn send_line(&self, line: &str) -> ToolhostResult<()> {
        self.process.send_line(line).await
    }

    async fn is_alive(&self) -> bool {
        !self.process.queue().is_closed() && self.process.is_alive().await
    }

    async fn shutdown(&self) {
        debug!(
            server_id = %self.process.server_id(),
            pid = self.process.pid(),
            "Detached from supervised process"
        );
    }
}
