//! Server registry hot reload.
//!
//! Watches `toolhost.toml` and hands the freshly parsed `[[servers]]` list to
//! a callback after a debounce window. Running processes are left alone; the
//! new entries apply the next time a server is started.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use toolhost_core::{ServerConfig, ToolhostError, ToolhostResult};

/// The reloadable part of the config file.
///
/// A file without a `[[servers]]` table parses to `None`, which callers must
/// not confuse with "remove every server".
#[derive(Debug, Clone, Deserialize)]
pub struct ReloadableConfig {
    /// The `[[servers]]` entries, if the section exists.
    #[serde(default)]
    pub servers: Option<Vec<ServerConfig>>,
}

/// Keeps a file watch alive; dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// * `debounce_ms` -- minimum milliseconds between two reload callbacks.
    /// * `on_reload` -- runs on a background thread after each change that
    ///   parses; parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> ToolhostResult<Self>
    where
        F: Fn(ReloadableConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| ToolhostError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| ToolhostError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let mut last_reload = std::time::Instant::now();
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // One reload per burst of writes.
                while rx.try_recv().is_ok() {}

                let elapsed = last_reload.elapsed();
                if elapsed < debounce {
                    std::thread::sleep(debounce - elapsed);
                }
                last_reload = std::time::Instant::now();

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read and parse the reloadable sections of a TOML config file.
pub fn parse_config(path: &Path) -> ToolhostResult<ReloadableConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ToolhostError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        ToolhostError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}
