//! amz-ssh
//!
//! Connects to EC2 instances through a bastion using short-lived keys
//! pushed with EC2 Instance Connect. Either opens an interactive shell on
//! the last hop or forwards a local port through the chain.

mod aws;
mod chain;
mod config;
mod endpoint;
mod error;
mod inventory;
mod keys;
mod resolver;
mod session;
#[cfg(test)]
mod testing;
mod tunnel;
mod update;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aws::{Ec2Inventory, InstanceConnectPusher};
use crate::chain::ChainBuilder;
use crate::config::Config;
use crate::endpoint::{EndpointFactory, NetworkEndpoint, Selector};
use crate::inventory::{Inventory, KeyPusher, TagFilter};
use crate::resolver::Resolver;
use crate::tunnel::Tunnel;

/// Connect to an EC2 instance via EC2 Instance Connect
#[derive(Parser, Debug)]
#[command(name = "amz-ssh", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write the default configuration to --config (or print it) and exit
    #[arg(long)]
    generate_config: bool,

    /// Region of the bastion and destinations
    #[arg(short, long)]
    region: Option<String>,

    /// Instance id to ssh or tunnel through
    #[arg(short, long)]
    instance_id: Option<String>,

    /// OS user of the bastion and instance destinations
    #[arg(short, long)]
    user: Option<String>,

    /// Tag used to find the bastion, as key:value
    #[arg(long)]
    tag: Option<String>,

    /// Host to tunnel to, as host[:port]
    #[arg(short, long)]
    tunnel: Option<String>,

    /// Local port to map to, defaults to the tunnel port
    #[arg(short, long)]
    port: Option<u16>,

    /// Further hops after the bastion, as [user@]target[:port] (repeatable)
    #[arg(short, long = "destination")]
    destination: Vec<String>,

    /// Private key for literal host hops
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Update the cli
    Update,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    // stdout belongs to the remote shell
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        return generate_config(cli.config.as_deref());
    }

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply CLI overrides
    if let Some(region) = cli.region.clone() {
        config.region = region;
    }
    if let Some(user) = cli.user.clone() {
        config.user = user;
    }
    if let Some(tag) = cli.tag.clone() {
        config.tag = tag;
    }
    if let Some(identity) = cli.identity.clone() {
        config.identity_file = Some(identity);
    }

    if let Some(Command::Update) = cli.command {
        if let Err(e) = update::run(&config.update_repository).await {
            warn!("Binary update failed: {:#}", e);
        }
        return Ok(());
    }

    let status = tokio::select! {
        result = run(cli, config) => result?,
        _ = shutdown_signal() => {
            eprintln!("goodbye");
            0
        }
    };

    if status != 0 {
        std::process::exit(i32::try_from(status).unwrap_or(255));
    }
    Ok(())
}

/// Resolve the bastion, assemble the chain and hand it to the shell or the
/// tunnel. Returns the exit status to report.
async fn run(cli: Cli, config: Config) -> Result<u32> {
    let sdk_config = aws::load_sdk_config(&config.region).await;
    let inventory: Arc<dyn Inventory> = Arc::new(Ec2Inventory::new(&sdk_config));
    let pusher: Arc<dyn KeyPusher> = Arc::new(InstanceConnectPusher::new(&sdk_config));

    let tag = TagFilter::parse(&config.tag).context("Invalid bastion tag")?;
    let bastion = Resolver::new(inventory.clone())
        .resolve(cli.instance_id.as_deref(), &tag)
        .await
        .context("Failed to resolve bastion")?;
    info!("Instance id: {}", bastion);

    let mut factory = EndpointFactory::new(inventory, pusher, config.user.clone());
    if let Some(path) = &config.identity_file {
        let identity = keys::load_identity(path).context("Failed to load identity file")?;
        factory = factory.with_identity(identity);
    }

    let mut selectors = vec![Selector {
        user: None,
        target: bastion,
        port: None,
    }];
    selectors.extend(cli.destination.iter().map(|d| Selector::parse(d)));
    let hops = factory
        .chain(&selectors)
        .await
        .context("Failed to prepare connection chain")?;

    let _refresh = keys::spawn_key_refresh(hops.clone(), Duration::from_secs(config.key_refresh_secs));
    let builder = Arc::new(ChainBuilder::new(&config.ssh));

    if let Some(tunnel_target) = cli.tunnel.as_deref().filter(|t| !t.trim().is_empty()) {
        let target = NetworkEndpoint::from_selector(&Selector::parse(tunnel_target));
        let local_port = cli.port.unwrap_or(target.port);
        let tunnel = Tunnel::bind(local_port, target, hops, builder)
            .await
            .context("Failed to open tunnel")?
            .with_drain_timeout(config.ssh.drain_timeout_secs.map(Duration::from_secs));
        tunnel.run().await.context("Tunnel stopped")?;
        return Ok(0);
    }

    let chain = builder.build(&hops).await.context("Failed to connect")?;
    let term = std::env::var("TERM")
        .ok()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| config.ssh.term.clone());
    let status = session::run_shell(&chain, &term).await;
    chain.close().await;

    status.context("Interactive session failed")
}

/// Save the defaults to `path`, or print them when no path was given.
fn generate_config(path: Option<&Path>) -> Result<()> {
    let config = Config::default();
    match path {
        Some(path) => {
            config.save(path)?;
            info!("Wrote default configuration to {}", path.display());
        }
        None => println!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_chain_and_tunnel() {
        let cli = Cli::try_parse_from([
            "amz-ssh",
            "-i",
            "i-0123456789abcdef0",
            "-d",
            "i-0aaa",
            "-d",
            "ubuntu@10.0.2.15:2222",
            "-t",
            "db.internal:5432",
            "-p",
            "15432",
        ])
        .unwrap();

        assert_eq!(cli.instance_id.as_deref(), Some("i-0123456789abcdef0"));
        assert_eq!(cli.destination, vec!["i-0aaa", "ubuntu@10.0.2.15:2222"]);
        assert_eq!(cli.tunnel.as_deref(), Some("db.internal:5432"));
        assert_eq!(cli.port, Some(15432));
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_update_subcommand() {
        let cli = Cli::try_parse_from(["amz-ssh", "-r", "us-east-1", "update"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Update)));
        assert_eq!(cli.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn test_generate_config_writes_loadable_defaults() {
        let dir = std::env::temp_dir().join(format!("amz-ssh-generate-{}", std::process::id()));
        let path = dir.join("nested").join("config.toml");
        let cli = Cli::try_parse_from([
            "amz-ssh",
            "--generate-config",
            "-c",
            path.to_str().unwrap(),
        ])
        .unwrap();
        assert!(cli.generate_config);

        generate_config(cli.config.as_deref()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.region, "eu-west-1");
        assert_eq!(loaded.tag, "role:bastion");
        assert_eq!(loaded.ssh.drain_timeout_secs, None);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["amz-ssh", "-p", "70000"]).is_err());
    }
}
