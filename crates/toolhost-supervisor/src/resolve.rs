//! Executable resolution and command construction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use toolhost_core::{CommandSpec, ToolhostResult};

/// Resolve the program to run.
///
/// Absolute paths are used as is. Otherwise, when a working directory is
/// given, `cwd/<program>` and then `cwd/.venv/bin/<name>` are tried. If
/// neither exists the bare program is returned for a `PATH` lookup.
pub fn resolve_executable(program: &str, cwd: Option<&Path>) -> PathBuf {
    let candidate = Path::new(program);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    if let Some(cwd) = cwd {
        let relative = cwd.join(candidate);
        if relative.is_file() {
            return relative;
        }
        if let Some(name) = candidate.file_name() {
            let venv = cwd.join(".venv").join("bin").join(name);
            if venv.is_file() {
                return venv;
            }
        }
    }
    candidate.to_path_buf()
}

/// Build a command with stdin, stdout and stderr piped. The child is killed
/// if its handle is dropped.
pub fn build_command(
    command: &CommandSpec,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> ToolhostResult<(Command, Vec<String>)> {
    let argv = command.to_argv()?;
    let program = resolve_executable(&argv[0], cwd);

    let mut cmd = Command::new(&program);
    cmd.args(&argv[1..])
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    Ok((cmd, argv))
}
