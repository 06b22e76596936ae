//! WolfMeta - Cluster Membership Directory and Leader Discovery
//!
//! Runs WolfMeta members backed by the in-process replicated store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmeta::cluster::ClusterBootstrap;
use wolfmeta::config::{LoggingConfig, WolfMetaConfig};
use wolfmeta::error::Result;
use wolfmeta::server::Server;
use wolfmeta::store::ReplicatedStore;

/// WolfMeta - Cluster Membership Directory and Leader Discovery
#[derive(Parser)]
#[command(name = "wolfmeta")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmeta.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a single member
    Start,

    /// Run a local cluster of several members in this process
    Cluster {
        /// Number of members
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Base directory for member data (defaults to a fresh temp directory)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmeta.toml")]
        output: PathBuf,

        /// Member name
        #[arg(long, default_value = "pd1")]
        name: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = WolfMetaConfig::from_file(&cli.config)?;
            init_logging(&config.logging, cli.log_level.as_deref());
            run_start(config).await
        }
        Commands::Cluster { nodes, data_dir } => {
            init_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            run_cluster(nodes, data_dir).await
        }
        Commands::Init { output, name } => run_init(output, name),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, level_override: Option<&str>) {
    let level = level_override.unwrap_or(&config.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run one member until Ctrl+C
async fn run_start(config: WolfMetaConfig) -> Result<()> {
    tracing::info!("Starting WolfMeta member {}...", config.node.name);

    let store = ReplicatedStore::new();
    let server = Server::new(config.clone(), store.connect(&config.node.name));
    server.start().await?;

    tracing::info!(
        "API available at {}{}",
        config.advertise_client_url(),
        config.api.prefix
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    server.close().await;
    Ok(())
}

/// Run a local cluster until Ctrl+C
async fn run_cluster(nodes: usize, data_dir: Option<PathBuf>) -> Result<()> {
    let base = data_dir.unwrap_or_else(|| {
        std::env::temp_dir().join(format!("wolfmeta-{}", uuid::Uuid::new_v4()))
    });
    tracing::info!("Starting local cluster of {} members under {:?}", nodes, base);

    let configs = WolfMetaConfig::test_cluster(nodes, &base)?;
    let store = ReplicatedStore::new();
    let mut cluster = ClusterBootstrap::start(configs, Arc::clone(&store)).await?;

    println!("WolfMeta local cluster");
    println!("======================");
    for server in cluster.servers() {
        let role = if server.is_leader().await { "leader" } else { "follower" };
        println!(
            "{:<8} {:<28} {}",
            server.name(),
            format!("{}{}", server.config().advertise_client_url(), server.config().api.prefix),
            role
        );
    }
    println!();
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    cluster.shutdown().await;
    let _ = std::fs::remove_dir(&base);
    Ok(())
}

/// Write a sample configuration
fn run_init(output: PathBuf, name: String) -> Result<()> {
    let config_content = format!(r#"# WolfMeta Configuration
# Generated configuration file

[node]
name = "{name}"
data_dir = "/var/lib/wolfmeta/{name}"
client_urls = "http://127.0.0.1:2379"
peer_urls = "http://127.0.0.1:2380"

[cluster]
election_timeout_min_ms = 300
election_timeout_max_ms = 600
leader_lease_ms = 3000
join_timeout_ms = 10000
settle_timeout_ms = 15000

[api]
enabled = true
prefix = "/pd/api/v1"
request_timeout_ms = 5000
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: wolfmeta --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfMetaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Name:        {}", config.node.name);
            println!("  Client URLs: {}", config.client_urls().join(", "));
            println!("  Peer URLs:   {}", config.peer_urls().join(", "));
            println!("  API:         {}{}", config.advertise_client_url(), config.api.prefix);
            println!("  Data Dir:    {}", config.data_dir().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
