//! WolfNFS - Cluster-wide File Replication Engine
//!
//! Daemon that runs one replication node with static membership taken
//! from its configuration file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfnfs::config::{LoggingConfig, NfsConfig};
use wolfnfs::error::Result;
use wolfnfs::network::{NetworkClient, NetworkServer, Transport};
use wolfnfs::NfsModule;

/// Idle time after which pooled peer connections are closed
const MAX_IDLE: Duration = Duration::from_secs(300);

/// WolfNFS - Cluster-wide File Replication Engine
#[derive(Parser)]
#[command(name = "wolfnfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfnfs.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WolfNFS node
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfnfs.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Initialize logging from the config file when there is one
    let mut logging = match cli.command {
        Commands::Init { .. } => LoggingConfig::default(),
        _ => NfsConfig::from_file(&cli.config)
            .map(|c| c.logging)
            .unwrap_or_default(),
    };
    if let Some(level) = cli.log_level.take() {
        logging.level = level;
    }
    init_logging(&logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format.as_str() {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Start the WolfNFS node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfNFS node...");

    // Load configuration
    let config = match NfsConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    // Ensure directories exist
    for dir in [config.files_dir(), config.index_dir()] {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!("Failed to create directory {:?}: {}", dir, e);
            return Err(e.into());
        }
    }

    let client = Arc::new(NetworkClient::new(
        config.connect_timeout(),
        config.request_timeout(),
    ));
    let transport: Arc<dyn Transport> = client.clone();

    let module = match NfsModule::new(&config, transport) {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::error!("Failed to open local store: {}", e);
            return Err(e);
        }
    };

    let server = match NetworkServer::bind(&config.node.bind_address, module.clone()).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.node.bind_address, e);
            module.close().await?;
            return Err(e);
        }
    };
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                tracing::error!("Network server error: {}", e);
            }
        })
    };

    // Static membership from the config file
    let current = config.advertise_address().to_string();
    let mut hosts = config.cluster.peers.clone();
    if !hosts.contains(&current) {
        hosts.push(current.clone());
    }
    module
        .update(hosts, config.master_address(), current.clone(), config.cluster.is_master)
        .await?;

    tracing::info!(
        "Node {} running at {} as {} ({} files held locally)",
        config.node.id,
        current,
        module.role(),
        module.query().len()
    );

    let cleanup_task = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAX_IDLE / 2);
            loop {
                interval.tick().await;
                client.cleanup_stale(MAX_IDLE).await;
            }
        })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down...");

    server.stop();
    let _ = server_task.await;
    cleanup_task.abort();

    let closed = module.close().await;
    client.close_all().await;

    let stats = module.stats();
    tracing::info!(
        "Replication totals: {} enqueued, {} completed, {} retried, {} dropped",
        stats.enqueued,
        stats.completed,
        stats.retried,
        stats.dropped
    );
    closed
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# WolfNFS Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7660"
data_dir = "/var/lib/wolfnfs/{node_id}"
# advertise_address = "my-public-ip:7660"

[storage]
index_file = "fingerprints.json"
rename = false

[cluster]
peers = []
# peers = ["node-2.example.com:7660", "node-3.example.com:7660"]
# master = "node-2.example.com:7660"
is_master = false

[replication]
workers = 4
queue_capacity = 1024
max_retries = 5
initial_backoff_ms = 500
max_backoff_ms = 30000
query_interval_ms = 60000

[network]
connect_timeout_ms = 3000
request_timeout_ms = 30000

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your cluster settings.");
    println!("Then start with: wolfnfs start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match NfsConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Peers: {}", config.cluster.peers.len());
            println!(
                "  Master: {}",
                config.master_address().unwrap_or_else(|| "(none)".to_string())
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = NfsConfig::from_file(&config_path)?;

    println!("WolfNFS Node Information");
    println!("========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Index File:       {}", config.index_path().display());
    println!();
    println!("Cluster Configuration:");
    println!("  Peers:          {:?}", config.cluster.peers);
    println!("  Master:         {:?}", config.master_address());
    println!("  Is Master:      {}", config.cluster.is_master);
    println!();
    println!("Replication Configuration:");
    println!("  Workers:        {}", config.replication.workers);
    println!("  Queue Capacity: {}", config.replication.queue_capacity);
    println!("  Max Attempts:   {}", config.replication.max_retries);
    println!(
        "  Backoff:        {}..{} ms",
        config.replication.initial_backoff_ms, config.replication.max_backoff_ms
    );

    Ok(())
}
