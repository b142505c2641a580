//! Launch configuration for a tool server.

use crate::{ToolhostError, ToolhostResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a server's command line is given.
///
/// The argument vector form is preferred. The single-string form is kept
/// for registries that store a raw command line; it is split with
/// shell-like quoting rules by [`split_command_line`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CommandSpec {
    /// Explicit argument vector; the first element is the executable.
    Argv(Vec<String>),
    /// Raw command line.
    Shell(String),
}

impl CommandSpec {
    /// Resolve into an argument vector with at least one element.
    pub fn to_argv(&self) -> ToolhostResult<Vec<String>> {
        let argv = match self {
            CommandSpec::Argv(argv) => argv.clone(),
            CommandSpec::Shell(line) => split_command_line(line)?,
        };
        if argv.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ToolhostError::Config("empty command".into()));
        }
        Ok(argv)
    }
}

impl From<&str> for CommandSpec {
    fn from(line: &str) -> Self {
        CommandSpec::Shell(line.to_string())
    }
}

impl From<Vec<String>> for CommandSpec {
    fn from(argv: Vec<String>) -> Self {
        CommandSpec::Argv(argv)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandSpec::Argv(argv) => write!(f, "{}", argv.join(" ")),
            CommandSpec::Shell(line) => write!(f, "{line}"),
        }
    }
}

/// Split a command line into arguments.
///
/// Supports single quotes (literal), double quotes (with `\"` and `\\`
/// escapes) and backslash escapes outside quotes. No variable expansion,
/// globbing or operators.
pub fn split_command_line(line: &str) -> ToolhostResult<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ToolhostError::Config(format!(
                                "unterminated single quote in command: {line}"
                            )))
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => break,
                        },
                        Some(inner) => current.push(inner),
                        None => {
                            return Err(ToolhostError::Config(format!(
                                "unterminated double quote in command: {line}"
                            )))
                        }
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// Transport a server speaks. Only `stdio` is hosted by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Newline-delimited JSON-RPC over the process's stdin and stdout.
    #[default]
    Stdio,
    /// Streamable HTTP.
    Http,
    /// Server-sent events.
    Sse,
}

/// Configuration for a single tool server, as returned by the registry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Registry id; also the key for the process and its logs.
    pub id: String,
    /// Executable and arguments.
    pub command: CommandSpec,
    /// Working directory; relative executables are resolved against it.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables, merged over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Only `stdio` servers can be hosted.
    #[serde(default)]
    pub transport_type: TransportType,
}

impl ServerConfig {
    /// A stdio server with no working directory or extra environment.
    pub fn new(id: impl Into<String>, command: impl Into<CommandSpec>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            cwd: None,
            env: HashMap::new(),
            transport_type: TransportType::Stdio,
        }
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_whitespace() {
        let args = split_command_line("  python  -m server   --port 9000 ").unwrap();
        assert_eq!(args, vec!["python", "-m", "server", "--port", "9000"]);
    }

    #[test]
    fn test_split_quoted_arguments() {
        let args = split_command_line(r#"node "my server.js" --name 'a b' x\ y"#).unwrap();
        assert_eq!(args, vec!["node", "my server.js", "--name", "a b", "x y"]);
    }

    #[test]
    fn test_split_escaped_quote_in_double_quotes() {
        let args = split_command_line(r#"echo "say \"hi\"""#).unwrap();
        assert_eq!(args, vec!["echo", r#"say "hi""#]);
    }

    #[test]
    fn test_split_empty_quotes_yield_empty_arg() {
        let args = split_command_line(r#"cmd "" end"#).unwrap();
        assert_eq!(args, vec!["cmd", "", "end"]);
    }

    #[test]
    fn test_split_unterminated_quote_fails() {
        assert!(split_command_line("cmd 'oops").is_err());
        assert!(split_command_line("cmd \"oops").is_err());
    }

    #[test]
    fn test_command_spec_to_argv() {
        let spec = CommandSpec::from("uvx mcp-server-git --repo .");
        assert_eq!(spec.to_argv().unwrap()[0], "uvx");

        let argv = CommandSpec::Argv(vec!["server".into(), "a b".into()]);
        assert_eq!(argv.to_argv().unwrap(), vec!["server", "a b"]);

        assert!(CommandSpec::from("   ").to_argv().is_err());
        assert!(CommandSpec::Argv(vec![]).to_argv().is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"id":"s1","command":"mock-echo-server"}"#).unwrap();
        assert_eq!(config.transport_type, TransportType::Stdio);
        assert!(config.cwd.is_none());
        assert!(config.env.is_empty());
        assert_eq!(config.command, CommandSpec::Shell("mock-echo-server".into()));
    }

    #[test]
    fn test_config_argv_form() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"id":"s2","command":["python","-m","srv"],"cwd":"/srv","env":{"K":"V"},"transport_type":"sse"}"#,
        )
        .unwrap();
        assert_eq!(config.transport_type, TransportType::Sse);
        assert_eq!(config.command.to_argv().unwrap().len(), 3);
        assert_eq!(config.env.get("K").map(String::as_str), Some("V"));
    }
}
