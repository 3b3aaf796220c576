//! txrelay - Replication Coordinator
//!
//! Runs one member of a primary/replica cluster, or talks to a running
//! member from the command line.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txrelay::config::TxRelayConfig;
use txrelay::error::{Error, Result};
use txrelay::membership::ClusterMembership;
use txrelay::node::ReplicationNode;
use txrelay::transport::{Endpoint, Request, RequestHandler, Response, TcpServer, TcpTransport, Transport};
use txrelay::txlog::{FileTxStore, TxStore};

/// txrelay - Replication Coordinator
#[derive(Parser)]
#[command(name = "txrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "txrelay.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "txrelay.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Query a node's replication status
    Status {
        /// Node address to query (host:port)
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        address: String,
    },

    /// Commit a payload through the primary
    Commit {
        /// Primary address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:7400")]
        address: String,

        /// Transaction payload
        #[arg(short, long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Init { output, node_id } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, node_id)
        }
        Commands::Validate => run_validate(cli.config),
        Commands::Status { address } => run_status(address).await,
        Commands::Commit { address, payload } => run_commit(address, payload).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let config = match TxRelayConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    init_logging(
        log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let store = match FileTxStore::open(config.log_path(), &config.log) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to open transaction log {:?}: {}", config.log_path(), e);
            return Err(e);
        }
    };
    tracing::info!(
        "Transaction log open, last committed tx: {}",
        store.last_committed_tx_id()
    );

    let membership = Arc::new(ClusterMembership::new(config.self_endpoint()));
    for peer in config.peers() {
        membership.join(peer).await;
    }
    if let Some(primary) = &config.cluster.primary {
        membership.set_primary(primary).await?;
    }
    tracing::info!("Cluster initialized with {} members", membership.members().await.len());

    let transport = Arc::new(TcpTransport::new(
        config.connect_timeout(),
        config.request_timeout(),
    ));
    let node = ReplicationNode::new(
        config.self_endpoint(),
        config.ha_settings(),
        store,
        membership,
        transport,
    )
    .await?;
    let events = node.start();
    tracing::info!("Node {} started as {}", node.id(), node.role());

    let handler: Arc<dyn RequestHandler> = Arc::clone(&node) as Arc<dyn RequestHandler>;
    let server = Arc::new(TcpServer::new(config.node.bind_address.clone(), handler));
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutting down...");
        }
        result = server_task => {
            match result {
                Ok(Ok(())) => tracing::info!("Replication server exited"),
                Ok(Err(e)) => {
                    tracing::error!("Replication server failed: {}", e);
                    node.shutdown();
                    return Err(e);
                }
                Err(e) => {
                    node.shutdown();
                    return Err(Error::Internal(format!("server task panicked: {}", e)));
                }
            }
        }
    }

    server.stop();
    node.shutdown();
    let _ = events.await;
    tracing::info!("Node {} stopped at tx {}", node.id(), node.last_committed_tx_id());
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# txrelay Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7400"
data_dir = "/var/lib/txrelay/{node_id}"
# advertise_address = "my-public-ip:7400"

[log]
compression = true
fsync = true

[ha]
pull_interval = "10s"
tx_push_factor = 1
push_timeout = "30s"
pull_retry_max = 6
pull_backoff_initial = "100ms"
pull_backoff_max = "5s"
pull_batch_size = 1000
pull_max_records = 100000
push_workers = 4

[cluster]
primary = "{node_id}"
members = []
# members = [{{ id = "node-2", address = "node-2.example.com:7400" }}]
connect_timeout_ms = 5000
request_timeout_ms = 60000

[logging]
level = "info"
format = "pretty"
"#
    );

    if output.exists() {
        return Err(Error::Config(format!("{} already exists", output.display())));
    }
    std::fs::write(&output, config_content)?;
    tracing::info!("Configuration written to {:?}", output);
    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match TxRelayConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Transaction Log: {}", config.log_path().display());
            println!(
                "  Primary: {}",
                config.cluster.primary.as_deref().unwrap_or("(none)")
            );
            println!("  Peers: {}", config.peers().len());
            println!("  Push Factor: {}", config.ha.tx_push_factor);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn cli_transport() -> TcpTransport {
    TcpTransport::new(
        std::time::Duration::from_secs(5),
        std::time::Duration::from_secs(60),
    )
}

/// Query a node's status
async fn run_status(address: String) -> Result<()> {
    let endpoint = Endpoint::new("remote", address);
    match cli_transport().call(&endpoint, Request::Status).await? {
        Response::Status(status) => {
            let text = serde_json::to_string_pretty(&status)
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{}", text);
            Ok(())
        }
        other => Err(Error::Network(format!(
            "Unexpected {} response to Status",
            other.type_name()
        ))),
    }
}

/// Commit a payload on the primary
async fn run_commit(address: String, payload: String) -> Result<()> {
    let endpoint = Endpoint::new("primary", address);
    let request = Request::ForwardCommit {
        origin: "txrelay-cli".into(),
        payload: Bytes::from(payload.into_bytes()),
    };
    match cli_transport().call(&endpoint, request).await? {
        Response::Committed { tx_id } => {
            println!("Committed tx {}", tx_id);
            Ok(())
        }
        Response::Nack { reason } => {
            eprintln!("Commit refused: {}", reason);
            Err(Error::Nack {
                endpoint: endpoint.to_string(),
                reason: reason.to_string(),
            })
        }
        other => Err(Error::Network(format!(
            "Unexpected {} response to ForwardCommit",
            other.type_name()
        ))),
    }
}
