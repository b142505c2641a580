use crate::buffer::LogBuffer;
use crate::process::{ManagedProcess, ProcessStatus};
use crate::queue::ProtocolQueue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use toolhost_core::{CommandSpec, ServerConfig, ToolhostError, ToolhostResult};
use tracing::{error, info, warn};

/// Tuning knobs for the supervisor.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Lines kept per server in the log ring (default: 1000).
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    /// Unclaimed protocol messages kept per process (default: 1000).
    #[serde(default = "default_queue_capacity")]
    pub protocol_queue_capacity: usize,
    /// Age after which an unclaimed protocol message is evicted. Should
    /// match the longest request deadline (default: 60000).
    #[serde(default = "default_message_ttl_ms")]
    pub message_ttl_ms: u64,
    /// How long a fresh process must survive to count as started (default: 500).
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,
    /// Grace period between terminate and kill (default: 5000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Pause between stop and start on restart (default: 250).
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,
}

fn default_log_capacity() -> usize {
    1000
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_message_ttl_ms() -> u64 {
    60_000
}
fn default_start_grace_ms() -> u64 {
    500
}
fn default_stop_grace_ms() -> u64 {
    5_000
}
fn default_restart_pause_ms() -> u64 {
    250
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_capacity: default_log_capacity(),
            protocol_queue_capacity: default_queue_capacity(),
            message_ttl_ms: default_message_ttl_ms(),
            start_grace_ms: default_start_grace_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_pause_ms: default_restart_pause_ms(),
        }
    }
}

impl SupervisorConfig {
    /// `start_grace_ms` as a duration.
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }

    /// `stop_grace_ms` as a duration.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// `restart_pause_ms` as a duration.
    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }

    /// `message_ttl_ms` as a duration.
    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl_ms)
    }
}

/// Snapshot of one supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    /// Server id.
    pub server_id: String,
    /// Status after probing the OS.
    pub status: ProcessStatus,
    /// OS process id.
    pub pid: Option<u32>,
    /// Resolved argument vector.
    pub command: Vec<String>,
    /// Spawn time.
    pub started_at: Option<DateTime<Utc>>,
    /// Lines currently in the log ring.
    pub log_lines: usize,
}

/// Owns one OS process per server id.
///
/// The process table is only locked to insert, remove or look up a record;
/// everything else happens on the per-server [`ManagedProcess`].
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
    logs: parking_lot::RwLock<HashMap<String, Arc<LogBuffer>>>,
    start_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Servers whose last start failed before a record existed.
    failures: parking_lot::Mutex<HashMap<String, String>>,
}

impl ProcessSupervisor {
    /// A supervisor with an empty process table.
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            processes: RwLock::new(HashMap::new()),
            logs: parking_lot::RwLock::new(HashMap::new()),
            start_locks: parking_lot::Mutex::new(HashMap::new()),
            failures: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// The tuning knobs in use.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn start_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.start_locks.lock();
        Arc::clone(
            locks
                .entry(server_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    fn log_buffer(&self, server_id: &str) -> Arc<LogBuffer> {
        if let Some(buffer) = self.logs.read().get(server_id) {
            return Arc::clone(buffer);
        }
        let mut logs = self.logs.write();
        Arc::clone(
            logs.entry(server_id.to_string())
                .or_insert_with(|| Arc::new(LogBuffer::new(self.config.log_capacity))),
        )
    }

    /// Start `server_id` unless it is already running, returning its pid.
    ///
    /// A record whose process has exited is replaced; a live one is reused.
    pub async fn start_process(
        &self,
        server_id: &str,
        command: &CommandSpec,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> ToolhostResult<u32> {
        let lock = self.start_lock(server_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.get_process(server_id).await {
            if existing.is_alive().await {
                return Ok(existing.pid());
            }
            info!(server_id = %server_id, pid = existing.pid(), "Replacing exited process record");
            self.processes.write().await.remove(server_id);
        }

        let queue = ProtocolQueue::new(
            server_id,
            self.config.protocol_queue_capacity,
            self.config.message_ttl(),
        );
        let logs = self.log_buffer(server_id);
        let process = ManagedProcess::spawn(server_id, command, cwd, env, queue, Arc::clone(&logs))
            .await
            .map_err(|e| {
                error!(server_id = %server_id, command = %command, error = %e, "Spawn failed");
                self.failures.lock().insert(server_id.to_string(), e.to_string());
                e
            })?;
        self.failures.lock().remove(server_id);
        let pid = process.pid();
        info!(server_id = %server_id, pid, command = %command, "Process spawned");

        // Visible as `Starting` and stoppable while the grace period runs.
        self.processes
            .write()
            .await
            .insert(server_id.to_string(), Arc::clone(&process));

        tokio::time::sleep(self.config.start_grace()).await;

        let still_current = self
            .get_process(server_id)
            .await
            .is_some_and(|current| Arc::ptr_eq(&current, &process));
        if !still_current {
            info!(server_id = %server_id, pid, "Process stopped during startup");
            return Err(ToolhostError::ProcessTerminated(format!(
                "'{server_id}' was stopped during startup"
            )));
        }

        if let Some(exit) = process.early_exit().await {
            process.set_status(ProcessStatus::Error);
            process.queue().close("exited during startup");
            let recent = logs.tail(5).join(" | ");
            warn!(server_id = %server_id, pid, status = %exit, "Process exited during startup");
            return Err(ToolhostError::Spawn(format!(
                "'{server_id}' exited during startup ({exit}): {recent}"
            )));
        }

        process.set_status(ProcessStatus::Running);
        info!(server_id = %server_id, pid, "Process running");
        Ok(pid)
    }

    /// Start a server from its registry configuration.
    pub async fn start(&self, config: &ServerConfig) -> ToolhostResult<u32> {
        self.start_process(&config.id, &config.command, config.cwd.as_deref(), &config.env)
            .await
    }

    /// Stop `server_id`, escalating to a kill after `grace`. Returns `false`
    /// if there was no record to stop.
    pub async fn stop_process(&self, server_id: &str, grace: Duration) -> ToolhostResult<bool> {
        self.failures.lock().remove(server_id);
        let Some(process) = self.processes.write().await.remove(server_id) else {
            return Ok(false);
        };
        info!(server_id = %server_id, pid = process.pid(), "Stopping process");
        let graceful = process.terminate(grace).await;
        if !graceful {
            warn!(server_id = %server_id, pid = process.pid(), "Process was force-killed");
        }
        Ok(true)
    }

    /// Stop, pause, and start again.
    pub async fn restart_process(
        &self,
        server_id: &str,
        command: &CommandSpec,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> ToolhostResult<u32> {
        self.stop_process(server_id, self.config.stop_grace()).await?;
        tokio::time::sleep(self.config.restart_pause()).await;
        self.start_process(server_id, command, cwd, env).await
    }

    /// Stop the process and forget its logs.
    pub async fn cleanup(&self, server_id: &str) -> ToolhostResult<bool> {
        let stopped = self.stop_process(server_id, self.config.stop_grace()).await?;
        self.logs.write().remove(server_id);
        self.start_locks.lock().remove(server_id);
        Ok(stopped)
    }

    /// Stop every supervised process in parallel.
    pub async fn shutdown_all(&self, grace: Duration) {
        let drained: Vec<Arc<ManagedProcess>> = {
            let mut processes = self.processes.write().await;
            processes.drain().map(|(_, process)| process).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Stopping all supervised processes");
        let mut handles = Vec::with_capacity(drained.len());
        for process in drained {
            handles.push(tokio::spawn(async move { process.terminate(grace).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// The record for `server_id`, whether or not the process is still alive.
    pub async fn get_process(&self, server_id: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(server_id).cloned()
    }

    /// The record for `server_id` only if its process is alive.
    pub async fn live_process(&self, server_id: &str) -> Option<Arc<ManagedProcess>> {
        let process = self.get_process(server_id).await?;
        process.is_alive().await.then_some(process)
    }

    /// Current status. Servers without a record are `Stopped`, or `Error`
    /// if their last start failed to spawn.
    pub async fn get_status(&self, server_id: &str) -> ProcessStatus {
        match self.get_process(server_id).await {
            Some(process) => {
                process.is_alive().await;
                process.status()
            }
            None if self.failures.lock().contains_key(server_id) => ProcessStatus::Error,
            None => ProcessStatus::Stopped,
        }
    }

    /// Why the last start of `server_id` failed to spawn, if it did.
    pub fn last_failure(&self, server_id: &str) -> Option<String> {
        self.failures.lock().get(server_id).cloned()
    }

    /// Pid of the current record, alive or not.
    pub async fn get_pid(&self, server_id: &str) -> Option<u32> {
        self.get_process(server_id).await.map(|process| process.pid())
    }

    /// The last `tail` log lines for `server_id`, oldest first.
    pub fn get_logs(&self, server_id: &str, tail: usize) -> Vec<String> {
        self.logs
            .read()
            .get(server_id)
            .map(|buffer| buffer.tail(tail))
            .unwrap_or_default()
    }

    /// Unclaimed protocol messages of the current process.
    pub async fn get_protocol_messages(&self, server_id: &str) -> Vec<String> {
        match self.get_process(server_id).await {
            Some(process) => process.queue().unclaimed(),
            None => Vec::new(),
        }
    }

    /// Summaries of every known server, sorted by id.
    pub async fn list(&self) -> Vec<ProcessSummary> {
        let processes: Vec<Arc<ManagedProcess>> =
            self.processes.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(processes.len());
        for process in processes {
            process.is_alive().await;
            summaries.push(ProcessSummary {
                server_id: process.server_id().to_string(),
                status: process.status(),
                pid: Some(process.pid()),
                command: process.argv().to_vec(),
                started_at: Some(process.started_at()),
                log_lines: process.logs().len(),
            });
        }
        summaries.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        summaries
    }

    /// Number of process records.
    pub async fn process_count(&self) -> usize {
        self.processes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: SupervisorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.log_capacity, 1000);
        assert_eq!(config.start_grace(), Duration::from_millis(500));
        assert_eq!(config.stop_grace(), Duration::from_secs(5));
        assert_eq!(config.message_ttl(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_unknown_server_reads() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
        assert_eq!(supervisor.get_status("ghost").await, ProcessStatus::Stopped);
        assert!(supervisor.get_pid("ghost").await.is_none());
        assert!(supervisor.get_logs("ghost", 10).is_empty());
        assert!(supervisor.get_protocol_messages("ghost").await.is_empty());
        assert!(!supervisor
            .stop_process("ghost", Duration::from_millis(10))
            .await
            .unwrap());
        assert!(supervisor.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let supervisor = ProcessSupervisor::new(SupervisorConfig::default());
        let err = supervisor
            .start_process(
                "bad",
                &CommandSpec::from("/nonexistent/mcp-server"),
                None,
                &HashMap::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolhostError::Spawn(_)));
        assert_eq!(supervisor.process_count().await, 0);
        assert_eq!(supervisor.get_status("bad").await, ProcessStatus::Error);
        assert!(supervisor.last_failure("bad").is_some());

        supervisor
            .stop_process("bad", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(supervisor.get_status("bad").await, ProcessStatus::Stopped);
    }
}
