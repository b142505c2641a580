use crate::buffer::LogBuffer;
use crate::queue::{is_protocol_line, ProtocolQueue};
use crate::resolve::build_command;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use toolhost_core::{CommandSpec, ToolhostError, ToolhostResult};
use tracing::{debug, info, warn};

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// No live process.
    Stopped,
    /// Spawned and inside the start grace period.
    Starting,
    /// Survived the start grace period.
    Running,
    /// Failed to spawn or exited during startup.
    Error,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A live (or recently exited) supervised process.
///
/// The supervisor's reader task is the only reader of the output streams.
/// Attached transports write through [`ManagedProcess::send_line`] and wait
/// for replies through [`ManagedProcess::queue`].
pub struct ManagedProcess {
    server_id: String,
    pid: u32,
    argv: Vec<String>,
    started_at: DateTime<Utc>,
    status: Arc<RwLock<ProcessStatus>>,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    queue: Arc<ProtocolQueue>,
    logs: Arc<LogBuffer>,
}

impl ManagedProcess {
    /// Spawn `command` and start draining its output.
    ///
    /// The process is not registered anywhere: the supervisor keeps the
    /// ones it owns in its table, an owned-mode transport keeps its own.
    pub async fn spawn(
        server_id: &str,
        command: &CommandSpec,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
        queue: Arc<ProtocolQueue>,
        logs: Arc<LogBuffer>,
    ) -> ToolhostResult<Arc<Self>> {
        let (mut cmd, argv) = build_command(command, cwd, env)?;
        let mut child = cmd.spawn().map_err(|e| {
            ToolhostError::Spawn(format!("failed to spawn '{}' for '{server_id}': {e}", argv[0]))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ToolhostError::Spawn(format!("'{server_id}' exited before it got a pid")))?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolhostError::Spawn("stdout not available".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolhostError::Spawn("stderr not available".into()))?;

        let status = Arc::new(RwLock::new(ProcessStatus::Starting));

        tokio::spawn(drain_output(
            server_id.to_string(),
            stdout,
            stderr,
            Arc::clone(&queue),
            Arc::clone(&logs),
            Arc::clone(&status),
        ));

        debug!(server_id = %server_id, pid, argv = ?argv, "Spawned child process");

        Ok(Arc::new(Self {
            server_id: server_id.to_string(),
            pid,
            argv,
            started_at: Utc::now(),
            status,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            queue,
            logs,
        }))
    }

    /// Server id the process was started for.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Resolved argument vector.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// When the process was spawned.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Last known status, without probing the OS.
    pub fn status(&self) -> ProcessStatus {
        *self.status.read()
    }

    /// Overwrite the recorded status.
    pub fn set_status(&self, status: ProcessStatus) {
        *self.status.write() = status;
    }

    /// Correlation queue fed by the reader task.
    pub fn queue(&self) -> &Arc<ProtocolQueue> {
        &self.queue
    }

    /// Non-protocol output.
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// Probe the OS. An exit noticed here moves the status to `Stopped`
    /// (unless it is already `Error`); it is never restarted implicitly.
    pub async fn is_alive(&self) -> bool {
        let exited = {
            let mut child = self.child.lock().await;
            match child.try_wait() {
                Ok(None) => None,
                Ok(Some(code)) => Some(code.to_string()),
                Err(e) => Some(format!("wait failed: {e}")),
            }
        };
        match exited {
            None => true,
            Some(reason) => {
                self.mark_exited(&reason);
                false
            }
        }
    }

    fn mark_exited(&self, reason: &str) {
        {
            let mut status = self.status.write();
            if *status != ProcessStatus::Error {
                *status = ProcessStatus::Stopped;
            }
        }
        self.queue.close(reason);
    }

    /// Write one newline-terminated line to the process input.
    pub async fn send_line(&self, line: &str) -> ToolhostResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ToolhostError::NotConnected(format!("{}: stdin closed", self.server_id)))?;

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.flush().await
        };
        write.await.map_err(|e| {
            ToolhostError::ProcessTerminated(format!(
                "{}: failed to write to stdin: {e}",
                self.server_id
            ))
        })
    }

    /// Exit status if the process has already exited during startup.
    pub async fn early_exit(&self) -> Option<String> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(code)) => Some(code.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    /// Stop the process: fail in-flight requests, close stdin, send a
    /// graceful terminate, and force-kill once `grace` has elapsed.
    /// Returns `true` if the process exited within the grace period.
    pub async fn terminate(&self, grace: Duration) -> bool {
        self.queue.close("process stopped");
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if matches!(child.try_wait(), Ok(Some(_))) {
            self.set_status(ProcessStatus::Stopped);
            return true;
        }

        send_terminate(&mut child, self.pid, &self.server_id);

        let graceful = match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(code)) => {
                info!(server_id = %self.server_id, pid = self.pid, status = %code, "Process exited");
                true
            }
            Ok(Err(e)) => {
                warn!(server_id = %self.server_id, error = %e, "Waiting for process failed");
                false
            }
            Err(_) => {
                warn!(
                    server_id = %self.server_id,
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Process ignored terminate, killing"
                );
                false
            }
        };

        if !graceful {
            if let Err(e) = child.start_kill() {
                debug!(server_id = %self.server_id, error = %e, "Kill failed (already gone?)");
            }
            let _ = child.wait().await;
        }
        self.set_status(ProcessStatus::Stopped);
        graceful
    }
}

#[cfg(unix)]
fn send_terminate(_child: &mut Child, pid: u32, server_id: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(server_id = %server_id, pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, pid: u32, server_id: &str) {
    if let Err(e) = child.start_kill() {
        debug!(server_id = %server_id, pid, error = %e, "Terminate failed");
    }
}

/// The reader task. Drains stdout and stderr as one merged stream until
/// both close, routing protocol lines to the queue and the rest to the log
/// buffer.
async fn drain_output(
    server_id: String,
    stdout: ChildStdout,
    stderr: ChildStderr,
    queue: Arc<ProtocolQueue>,
    logs: Arc<LogBuffer>,
    status: Arc<RwLock<ProcessStatus>>,
) {
    let mut out = BufReader::new(stdout).split(b'\n');
    let mut err = BufReader::new(stderr).split(b'\n');
    let mut out_open = true;
    let mut err_open = true;

    let route = |raw: Vec<u8>| {
        let line = decode_line(raw);
        if line.trim().is_empty() {
            return;
        }
        if is_protocol_line(&line) {
            queue.deliver(&line);
        } else {
            debug!(server_id = %server_id, line = %line, "Server output");
            logs.push(line);
        }
    };

    while out_open || err_open {
        tokio::select! {
            next = out.next_segment(), if out_open => match next {
                Ok(Some(raw)) => route(raw),
                Ok(None) => out_open = false,
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "Error reading stdout");
                    out_open = false;
                }
            },
            next = err.next_segment(), if err_open => match next {
                Ok(Some(raw)) => route(raw),
                Ok(None) => err_open = false,
                Err(e) => {
                    warn!(server_id = %server_id, error = %e, "Error reading stderr");
                    err_open = false;
                }
            },
        }
    }

    {
        let mut status = status.write();
        if *status != ProcessStatus::Error {
            *status = ProcessStatus::Stopped;
        }
    }
    queue.close("output stream closed");
    info!(server_id = %server_id, "Process output closed");
}

fn decode_line(mut raw: Vec<u8>) -> String {
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    match String::from_utf8(raw) {
        Ok(line) => line,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line_strips_cr_and_replaces_invalid_utf8() {
        assert_eq!(decode_line(b"hello\r".to_vec()), "hello");
        let decoded = decode_line(vec![b'o', b'k', 0xff, b'!']);
        assert_eq!(decoded, "ok\u{fffd}!");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ProcessStatus::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ProcessStatus::Stopped).unwrap(),
            "\"stopped\""
        );
    }
}
