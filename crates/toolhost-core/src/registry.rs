//! Collaborators that tell toolhost which servers exist and where they live.

use crate::{ServerConfig, ToolhostError, ToolhostResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;

/// Resolves a server id to its launch configuration.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Configuration for `server_id`, or [`ToolhostError::UnknownServer`].
    async fn get_config(&self, server_id: &str) -> ToolhostResult<ServerConfig>;
    async fn list(&self) -> ToolhostResult<Vec<ServerConfig>>;
}

/// Fetches or installs a server's code and returns its working directory.
///
/// Only consulted when a registry entry has no working directory of its own.
#[async_trait]
pub trait SourceProvisioner: Send + Sync {
    async fn ensure(&self, server_id: &str) -> ToolhostResult<PathBuf>;
}

/// Registry backed by an in-memory map. The CLI fills it from the config
/// file and swaps the whole set on reload.
#[derive(Default)]
pub struct InMemoryServerRegistry {
    servers: RwLock<HashMap<String, ServerConfig>>,
}

impl InMemoryServerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `configs`, keyed by id.
    pub fn from_configs(configs: impl IntoIterator<Item = ServerConfig>) -> Self {
        let registry = Self::new();
        registry.replace_all(configs);
        registry
    }

    /// Add or replace one server.
    pub fn insert(&self, config: ServerConfig) {
        self.servers.write().insert(config.id.clone(), config);
    }

    /// Forget one server.
    pub fn remove(&self, server_id: &str) -> Option<ServerConfig> {
        self.servers.write().remove(server_id)
    }

    /// Replace every entry at once. Returns the new entry count.
    pub fn replace_all(&self, configs: impl IntoIterator<Item = ServerConfig>) -> usize {
        let fresh: HashMap<String, ServerConfig> = configs
            .into_iter()
            .map(|config| (config.id.clone(), config))
            .collect();
        let count = fresh.len();
        *self.servers.write() = fresh;
        count
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    /// Whether no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}

#[async_trait]
impl ServerRegistry for InMemoryServerRegistry {
    async fn get_config(&self, server_id: &str) -> ToolhostResult<ServerConfig> {
        self.servers
            .read()
            .get(server_id)
            .cloned()
            .ok_or_else(|| ToolhostError::UnknownServer(server_id.to_string()))
    }

    async fn list(&self) -> ToolhostResult<Vec<ServerConfig>> {
        let mut configs: Vec<ServerConfig> = self.servers.read().values().cloned().collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }
}
