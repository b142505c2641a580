//! Correlation of JSON-RPC responses with the requests waiting for them.
//!
//! Every outstanding request registers its id here *before* its line is
//! written. When the reader task sees a reply, it removes the matching entry
//! under the lock and hands the response straight to the waiter, so a reply
//! can be claimed at most once. Replies nobody is waiting for (late answers
//! to timed-out requests, notifications, server-initiated requests) go into
//! a bounded queue of unclaimed messages that is only ever inspected, never
//! matched retroactively.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use toolhost_core::{JsonRpcResponse, ToolhostError, ToolhostResult};
use tracing::{debug, warn};

type ReplySender = oneshot::Sender<ToolhostResult<JsonRpcResponse>>;

/// A line classifies as a protocol message iff, trimmed, it starts with `{`
/// and mentions `"jsonrpc"`. False positives are dropped on decode.
pub fn is_protocol_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('{') && trimmed.contains("\"jsonrpc\"")
}

/// A protocol line that no waiter claimed.
#[derive(Debug, Clone, Serialize)]
pub struct UnclaimedMessage {
    /// The trimmed raw line.
    pub line: String,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
    #[serde(skip)]
    arrived: Instant,
}

struct Pending {
    token: u64,
    tx: ReplySender,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<u64, Pending>,
    unclaimed: VecDeque<UnclaimedMessage>,
    closed: Option<String>,
}

/// Per-process correlation map plus the unclaimed message queue.
pub struct ProtocolQueue {
    server_id: String,
    state: Mutex<QueueState>,
    capacity: usize,
    ttl: Duration,
    next_token: AtomicU64,
    next_request_id: AtomicU64,
}

impl ProtocolQueue {
    /// `capacity` bounds the unclaimed queue; `ttl` is the age after which
    /// an unclaimed message is evicted (the longest request deadline).
    pub fn new(server_id: impl Into<String>, capacity: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            server_id: server_id.into(),
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            ttl,
            next_token: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Server id, used in error messages.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register interest in the reply with `request_id`.
    ///
    /// Fails with `ProcessTerminated` once the queue is closed and with
    /// `InvalidRequest` if the id is already outstanding.
    pub fn register(self: &Arc<Self>, request_id: u64) -> ToolhostResult<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if state.pending.contains_key(&request_id) {
            return Err(ToolhostError::InvalidRequest(format!(
                "request id {request_id} already outstanding on '{}'",
                self.server_id
            )));
        }
        state.pending.insert(request_id, Pending { token, tx });
        Ok(self.pending_reply(request_id, token, rx))
    }

    /// Allocate a fresh request id and register interest in its reply.
    ///
    /// Ids come from one counter per process, so every client of the same
    /// process gets ids that were never used on it before, and a late reply
    /// to an abandoned request can never match a newer one.
    pub fn register_next(self: &Arc<Self>) -> ToolhostResult<PendingReply> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        let request_id = loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if !state.pending.contains_key(&id) {
                break id;
            }
        };
        state.pending.insert(request_id, Pending { token, tx });
        Ok(self.pending_reply(request_id, token, rx))
    }

    fn ensure_open(&self, state: &QueueState) -> ToolhostResult<()> {
        match &state.closed {
            Some(reason) => Err(ToolhostError::ProcessTerminated(format!(
                "{}: {reason}",
                self.server_id
            ))),
            None => Ok(()),
        }
    }

    fn pending_reply(
        self: &Arc<Self>,
        request_id: u64,
        token: u64,
        rx: oneshot::Receiver<ToolhostResult<JsonRpcResponse>>,
    ) -> PendingReply {
        PendingReply {
            queue: Arc::clone(self),
            request_id,
            token,
            rx: Some(rx),
        }
    }

    /// Route one protocol line: resolve the matching waiter or keep it as
    /// unclaimed. Undecodable lines are dropped.
    pub fn deliver(&self, line: &str) {
        let response: JsonRpcResponse = match serde_json::from_str(line.trim()) {
            Ok(response) => response,
            Err(e) => {
                let err = ToolhostError::ProtocolDecode(e.to_string());
                debug!(server_id = %self.server_id, error = %err, "Dropping malformed protocol line");
                return;
            }
        };

        let mut state = self.state.lock();
        if response.is_reply() {
            if let Some(id) = response.request_id() {
                if let Some(pending) = state.pending.remove(&id) {
                    drop(state);
                    if pending.tx.send(Ok(response)).is_ok() {
                        debug!(server_id = %self.server_id, request_id = id, "Correlated response");
                        return;
                    }
                    // The waiter timed out after the entry was claimed.
                    debug!(server_id = %self.server_id, request_id = id, "Waiter went away before delivery");
                    state = self.state.lock();
                }
            }
        }

        self.evict_expired(&mut state.unclaimed);
        if state.unclaimed.len() >= self.capacity {
            state.unclaimed.pop_front();
        }
        state.unclaimed.push_back(UnclaimedMessage {
            line: line.trim().to_string(),
            received_at: Utc::now(),
            arrived: Instant::now(),
        });
    }

    fn evict_expired(&self, unclaimed: &mut VecDeque<UnclaimedMessage>) {
        while unclaimed
            .front()
            .is_some_and(|msg| msg.arrived.elapsed() > self.ttl)
        {
            unclaimed.pop_front();
        }
    }

    /// Fail every outstanding waiter with `ProcessTerminated` and refuse new
    /// registrations. Only the first call has any effect.
    pub fn close(&self, reason: &str) {
        let drained: Vec<(u64, Pending)> = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(reason.to_string());
            state.pending.drain().collect()
        };
        if !drained.is_empty() {
            warn!(
                server_id = %self.server_id,
                pending = drained.len(),
                reason = %reason,
                "Failing in-flight requests"
            );
        }
        for (_, pending) in drained {
            let _ = pending.tx.send(Err(ToolhostError::ProcessTerminated(format!(
                "{}: {reason}",
                self.server_id
            ))));
        }
    }

    /// Whether the process behind the queue is gone.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed.is_some()
    }

    /// Raw unclaimed lines in arrival order.
    pub fn unclaimed(&self) -> Vec<String> {
        let mut state = self.state.lock();
        self.evict_expired(&mut state.unclaimed);
        state.unclaimed.iter().map(|msg| msg.line.clone()).collect()
    }

    /// Unclaimed messages with their arrival timestamps.
    pub fn unclaimed_messages(&self) -> Vec<UnclaimedMessage> {
        let mut state = self.state.lock();
        self.evict_expired(&mut state.unclaimed);
        state.unclaimed.iter().cloned().collect()
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn cancel(&self, request_id: u64, token: u64) {
        let mut state = self.state.lock();
        if state
            .pending
            .get(&request_id)
            .is_some_and(|pending| pending.token == token)
        {
            state.pending.remove(&request_id);
        }
    }
}

/// A registered waiter for one reply. Dropping it withdraws the
/// registration, so an abandoned request never claims a later message.
pub struct PendingReply {
    queue: Arc<ProtocolQueue>,
    request_id: u64,
    token: u64,
    rx: Option<oneshot::Receiver<ToolhostResult<JsonRpcResponse>>>,
}

impl PendingReply {
    /// Id the request must be sent with.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Wait up to `timeout` for the correlated reply.
    pub async fn wait(mut self, timeout: Duration) -> ToolhostResult<JsonRpcResponse> {
        let Some(rx) = self.rx.take() else {
            return Err(ToolhostError::NotConnected(self.queue.server_id.clone()));
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ToolhostError::ProcessTerminated(format!(
                "{}: reply channel closed",
                self.queue.server_id
            ))),
            Err(_) => {
                self.queue.cancel(self.request_id, self.token);
                Err(ToolhostError::Timeout(format!(
                    "no response to request {} from '{}' within {}ms",
                    self.request_id,
                    self.queue.server_id,
                    timeout.as_millis()
                )))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.queue.cancel(self.request_id, self.token);
    }
}
