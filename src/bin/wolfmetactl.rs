//! WolfMetaCtl - Command line tool for WolfMeta clusters
//!
//! Usage:
//!   wolfmetactl members list         - List cluster members
//!   wolfmetactl members get NAME     - Show one member
//!   wolfmetactl members delete NAME  - Remove a member
//!   wolfmetactl leader               - Show the current leader
//!   wolfmetactl health               - Show node health

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use wolfmeta::client::MembersClient;
use wolfmeta::config::{ApiConfig, WolfMetaConfig};
use wolfmeta::Error;

/// WolfMeta Cluster Control Tool
#[derive(Parser)]
#[command(name = "wolfmetactl")]
#[command(about = "Inspect and manage WolfMeta cluster membership", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfmeta/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Member operations
    Members {
        #[command(subcommand)]
        what: MembersSubcommand,
    },
    /// Show the current leader
    Leader,
    /// Show health of the node
    Health,
}

#[derive(Subcommand)]
enum MembersSubcommand {
    /// List all members
    List,
    /// Show one member
    Get {
        /// Member name
        name: String,
    },
    /// Remove a member
    Delete {
        /// Member name
        name: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (endpoint, prefix) = resolve_endpoint(&cli)?;
    let client = MembersClient::new(&endpoint, &prefix, Duration::from_millis(cli.timeout_ms))?;

    match cli.command {
        Commands::Members { what } => match what {
            MembersSubcommand::List => list_members(&client).await,
            MembersSubcommand::Get { name } => show_member(&client, &name).await,
            MembersSubcommand::Delete { name } => delete_member(&client, &name).await,
        },
        Commands::Leader => show_leader(&client).await,
        Commands::Health => show_health(&client).await,
    }
}

/// Endpoint and route prefix, from the flag or the config file
fn resolve_endpoint(cli: &Cli) -> Result<(String, String)> {
    if let Some(endpoint) = &cli.endpoint {
        let endpoint = if endpoint.starts_with("http") {
            endpoint.clone()
        } else {
            format!("http://{}", endpoint)
        };
        return Ok((endpoint, ApiConfig::default().prefix));
    }

    let config = WolfMetaConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    Ok((config.advertise_client_url(), config.api.prefix))
}

// ============ Commands ============

async fn list_members(client: &MembersClient) -> Result<()> {
    let members = client.list_members().await?;

    println!();
    println!("WolfMeta Members (wolfmetactl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();

    let leader = match client.leader().await {
        Ok(leader) => Some(leader),
        Err(Error::NoLeader) => None,
        Err(e) => return Err(e.into()),
    };
    match &leader {
        Some(leader) => println!("Total: {} members  |  Leader: {}", members.len(), leader.addr),
        None => println!("Total: {} members  |  Leader: NONE", members.len()),
    }
    println!();

    println!("{:<16} {:<18} {:<30} {}", "NAME", "ID", "CLIENT URLS", "PEER URLS");
    println!("{}", "-".repeat(90));
    for member in &members {
        let leads = leader
            .as_ref()
            .map(|l| member.client_urls.contains(&l.addr))
            .unwrap_or(false);
        let name = if leads {
            format!("\x1b[1;34m{:<16}\x1b[0m", member.name)
        } else {
            format!("{:<16}", member.name)
        };
        println!(
            "{} {:<18} {:<30} {}",
            name,
            format!("{:x}", member.id),
            member.client_urls.join(","),
            member.peer_urls.join(",")
        );
    }
    println!();

    Ok(())
}

async fn show_member(client: &MembersClient, name: &str) -> Result<()> {
    let member = client.get_member(name).await?;
    println!("{}", serde_json::to_string_pretty(&member)?);
    Ok(())
}

async fn delete_member(client: &MembersClient, name: &str) -> Result<()> {
    match client.delete_member(name).await {
        Ok(()) => {
            println!("✓ Member {} removed", name);
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            anyhow::bail!("no member named {}", name)
        }
        Err(e) => Err(e.into()),
    }
}

async fn show_leader(client: &MembersClient) -> Result<()> {
    match client.leader().await {
        Ok(leader) => {
            println!("Leader: {} (pid {})", leader.addr, leader.pid);
            Ok(())
        }
        Err(Error::NoLeader) => {
            println!("Leader: NONE (election in progress)");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn show_health(client: &MembersClient) -> Result<()> {
    let health = client
        .health()
        .await
        .with_context(|| format!("node at {} is unreachable", client.base_url()))?;
    println!("Node:    {}", health.name);
    println!("Healthy: {}", health.healthy);
    println!("Role:    {}", if health.is_leader { "leader" } else { "follower" });
    Ok(())
}
