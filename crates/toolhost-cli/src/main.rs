mod config_watcher;

use clap::{Parser, Subcommand};
use config_watcher::ConfigWatcher;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use toolhost_core::{InMemoryServerRegistry, ServerConfig, ServerRegistry};
use toolhost_gateway::{GatewayServer, McpAdapter};
use toolhost_mcp::{McpTransport, TransportConfig};
use toolhost_supervisor::{ProcessSupervisor, SupervisorConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RELOAD_DEBOUNCE_MS: u64 = 500;

#[derive(Parser)]
#[command(name = "toolhost", about = "Host MCP stdio tool servers behind an HTTP gateway")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "toolhost.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Do not reload `[[servers]]` when the config file changes
        #[arg(long)]
        no_watch: bool,
    },
    /// List configured servers
    Servers,
    /// Spawn a server, print its tools and stop it
    Tools {
        /// Server id from the config file
        server: String,
    },
    /// Spawn a server, call one tool and stop it
    Call {
        /// Server id from the config file
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[derive(Deserialize, Default)]
struct ToolhostConfig {
    #[serde(default)]
    server: HttpConfig,
    #[serde(default)]
    supervisor: SupervisorConfig,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

impl ToolhostConfig {
    fn find_server(&self, id: &str) -> anyhow::Result<ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown server '{id}'; add it under [[servers]]"))
    }

    /// Supervisor settings with the unclaimed-message TTL raised to at least
    /// the request timeout.
    fn supervisor_config(&self) -> SupervisorConfig {
        let mut config = self.supervisor.clone();
        let request_timeout_ms = self.transport.request_timeout_secs.saturating_mul(1000);
        config.message_ttl_ms = config.message_ttl_ms.max(request_timeout_ms);
        config
    }
}

#[derive(Deserialize)]
struct HttpConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3100
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let config_str = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {e}", cli.config.display())
    })?;
    let config: ToolhostConfig = toml::from_str(&config_str)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            no_watch,
        } => serve(cli.config, config, host, port, no_watch).await?,
        Commands::Servers => {
            if config.servers.is_empty() {
                println!("No servers configured.");
                println!("Configure servers in toolhost.toml under [[servers]]");
            } else {
                println!("Configured servers:");
                for server in &config.servers {
                    let transport = serde_json::to_value(server.transport_type)?;
                    println!("  {} [{}] {}", server.id, transport.as_str().unwrap_or("?"), server.command);
                    if let Some(cwd) = &server.cwd {
                        println!("    cwd: {}", cwd.display());
                    }
                }
                println!("\nTotal: {} server(s)", config.servers.len());
            }
        }
        Commands::Tools { server } => {
            let transport = McpTransport::owned(config.find_server(&server)?, config.transport);
            let result = transport.connect(None).await;
            transport.disconnect().await;
            let tools = result?;
            if let Some(info) = transport.server_info().and_then(|i| i.server_info) {
                println!("{} {}", info.name, info.version);
            }
            for tool in &tools {
                println!("  {}: {}", tool.name, tool.description);
            }
            println!("\nTotal: {} tool(s)", tools.len());
        }
        Commands::Call { server, tool, args } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)
                .map_err(|e| anyhow::anyhow!("--args must be a JSON object: {e}"))?;
            let transport = McpTransport::owned(config.find_server(&server)?, config.transport);
            let result = transport.call_tool(&tool, arguments).await;
            transport.disconnect().await;
            let output = result?;
            for line in &output.content {
                println!("{line}");
            }
            if output.is_error {
                anyhow::bail!("Tool '{tool}' reported an error");
            }
        }
    }

    Ok(())
}

async fn serve(
    config_path: PathBuf,
    config: ToolhostConfig,
    host: Option<String>,
    port: Option<u16>,
    no_watch: bool,
) -> anyhow::Result<()> {
    let supervisor = ProcessSupervisor::new(config.supervisor_config());
    let registry = Arc::new(InMemoryServerRegistry::from_configs(config.servers));
    info!(servers = registry.len(), "Server registry loaded");

    let _watcher = if no_watch {
        None
    } else {
        let registry = Arc::clone(&registry);
        Some(ConfigWatcher::start(
            config_path,
            RELOAD_DEBOUNCE_MS,
            move |reloaded| match reloaded.servers {
                Some(servers) => {
                    let count = registry.replace_all(servers);
                    info!(servers = count, "Server registry reloaded");
                }
                None => warn!("Config has no [[servers]] section, keeping current registry"),
            },
        )?)
    };

    let adapter = Arc::new(McpAdapter::new(
        Arc::clone(&supervisor),
        registry as Arc<dyn ServerRegistry>,
        config.transport,
    ));
    let app = GatewayServer::build(Arc::clone(&adapter));

    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "toolhost gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    adapter.shutdown().await;
    supervisor
        .shutdown_all(supervisor.config().stop_grace())
        .await;
    info!("toolhost stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
