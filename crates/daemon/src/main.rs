/// bitmesh daemon
///
/// Connects to the local routing daemon's control port, builds and pays for
/// circuits, keeps the token wallet stocked, and serves a small status API.

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use bitmesh_common::NodeConfig;
use bitmesh_core::{Node, RouterSnapshot};
use bitmesh_daemon::ApiServer;

const CONFIG_FILE: &str = "bitmesh.toml";

/// Where the configuration came from
enum ConfigSource {
    File,
    Created,
    /// Defaults that could not be written out
    Unsaved(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");
    let config_path = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));

    match command {
        "help" | "--help" | "-h" => print_help(),
        "version" | "--version" | "-v" => {
            println!("bitmesh daemon v{}", env!("CARGO_PKG_VERSION"));
        }
        "init-config" => init_config(&config_path)?,
        "run" => run(&config_path).await?,
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn load_config(path: &Path) -> Result<(NodeConfig, ConfigSource)> {
    let path = path.to_path_buf();
    if path.exists() {
        let config = NodeConfig::from_file(&path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        return Ok((config, ConfigSource::File));
    }

    let config = NodeConfig::default();
    let source = match config.to_file(&path) {
        Ok(()) => ConfigSource::Created,
        Err(e) => ConfigSource::Unsaved(e.to_string()),
    };
    Ok((config, source))
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    NodeConfig::default()
        .to_file(&path.to_path_buf())
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn run(config_path: &Path) -> Result<()> {
    let (config, source) = load_config(config_path)?;
    init_logging(config.verbose);

    info!("Starting bitmesh daemon v{}", env!("CARGO_PKG_VERSION"));
    match source {
        ConfigSource::File => info!("Loaded configuration from {:?}", config_path),
        ConfigSource::Created => info!("Saved default configuration to {:?}", config_path),
        ConfigSource::Unsaved(e) => warn!("Failed to save default config: {}", e),
    }

    let api_addr: SocketAddr = config
        .api_addr
        .parse()
        .with_context(|| format!("invalid api_addr {}", config.api_addr))?;

    info!("Creating bitmesh node...");
    let node = Node::new(config).await?;
    let snapshots = node.subscribe_snapshots();

    let api_server = ApiServer::new(api_addr, snapshots.clone());
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    let (stop, shutdown) = watch::channel(false);
    let node_task = tokio::spawn(node.run(shutdown));

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    // the node may already have exited on its own
    let _ = stop.send(true);
    node_task.await??;

    print_status(&snapshots.borrow());
    Ok(())
}

fn print_status(snapshot: &RouterSnapshot) {
    println!("\n========================================");
    println!("         bitmesh Node Status");
    println!("========================================");
    println!("Relays known:     {}", snapshot.relays);
    println!("Circuits:         {}", snapshot.circuits.len());
    println!("Bytes read:       {}", snapshot.bytes_read);
    println!("Bytes written:    {}", snapshot.bytes_written);
    println!("Tokens held:      {}", snapshot.wallet.balance);
    println!("Tokens spent:     {}", snapshot.wallet.spent);
    println!("========================================\n");
}

fn print_help() {
    println!("bitmesh daemon - paid onion routing client");
    println!();
    println!("USAGE:");
    println!("    bitmesh-daemon [COMMAND] [CONFIG]");
    println!();
    println!("COMMANDS:");
    println!("    run           Connect to the routing daemon and run (default)");
    println!("    init-config   Write a default configuration file");
    println!("    help          Show this help message");
    println!("    version       Show version information");
    println!();
    println!("CONFIG defaults to ./{}", CONFIG_FILE);
    println!();
    println!("STATUS API (api_addr, default 127.0.0.1:9150):");
    println!("    GET /health");
    println!("    GET /api/status");
    println!("    GET /api/wallet");
    println!("    GET /api/circuits");
    println!("    GET /api/circuits/<key>");
}
