//! Process supervision for stdio tool servers.
//!
//! One OS process per server id. Each process gets a single reader task that
//! drains its stdout and stderr line by line and splits the traffic in two:
//! JSON-RPC lines go to the [`ProtocolQueue`] (where waiting requests are
//! resolved by id), everything else lands in a bounded [`LogBuffer`].

/// Bounded log ring.
pub mod buffer;
/// One spawned process and its reader task.
pub mod process;
/// Reply correlation and the unclaimed message queue.
pub mod queue;
/// Executable lookup.
pub mod resolve;
/// The process table.
pub mod supervisor;

pub use buffer::LogBuffer;
pub use process::{ManagedProcess, ProcessStatus};
pub use queue::{is_protocol_line, PendingReply, ProtocolQueue};
pub use resolve::{build_command, resolve_executable};
pub use supervisor::{ProcessSummary, ProcessSupervisor, SupervisorConfig};
