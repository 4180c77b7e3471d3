//! CLI entry point for the p2pchat node.
//!
//! Provides key and configuration management and runs an interactive node
//! against a Supabase directory.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use p2pchat::{
    network::SupabaseDirectory,
    node::{DeliveredMessage, MessageDirection},
    utils::{ChatConfig, StorageConfig, DEFAULT_CONFIG_FILE},
    DirectoryClient, Node, NodeKeys,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Peer-to-peer encrypted chat with directory discovery and offline delivery
#[derive(Parser)]
#[command(name = "p2pchat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys, friends and history
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect the node's key pair
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Start the node and read chat commands from stdin
    Run {
        /// Username to register (overrides the configuration)
        #[arg(short, long)]
        username: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address peers should dial, as host:port
        #[arg(short, long)]
        advertise: Option<String>,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new key pair
    Generate {
        /// Overwrite an existing key file
        #[arg(short, long)]
        force: bool,
    },
    /// Display the public keys
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ChatConfig::load_unvalidated(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage = StorageConfig::under(data_dir);
    }
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Run {
            username,
            port,
            advertise,
        } => {
            if let Some(username) = username {
                config.node.username = username;
            }
            if let Some(port) = port {
                config.node.listen_port = port;
            }
            if advertise.is_some() {
                config.node.advertise_address = advertise;
            }
            handle_run_command(config).await
        }
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn handle_key_commands(action: KeyCommands, config: &ChatConfig) -> Result<()> {
    let key_file = &config.storage.key_file;
    match action {
        KeyCommands::Generate { force } => {
            if key_file.exists() && !force {
                bail!("Key file {} already exists. Use --force to overwrite.", key_file.display());
            }
            let keys = NodeKeys::generate()?;
            keys.save(key_file)?;
            println!("✓ Keys generated");
            println!("  Node ID: {}", keys.node_id());
            println!("  Saved to: {}", key_file.display());
        }
        KeyCommands::Show { format } => {
            let keys = NodeKeys::load(key_file)
                .with_context(|| format!("cannot load keys from {}", key_file.display()))?;
            let encode = |bytes: &[u8]| match format.as_str() {
                "hex" => Ok(hex::encode(bytes)),
                "base64" => Ok(general_purpose::STANDARD.encode(bytes)),
                other => Err(anyhow!("Unsupported format: {other}")),
            };
            println!("Node ID:        {}", keys.node_id());
            println!("Encryption key: {}", encode(&keys.encryption_public())?);
            println!("Signing key:    {}", encode(&keys.signing_public())?);
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &ChatConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            if output_path.exists() {
                bail!("{} already exists", output_path.display());
            }
            ChatConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            match file {
                Some(path) => {
                    ChatConfig::from_file(path)?;
                }
                None => config.validate()?,
            }
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

async fn handle_run_command(config: ChatConfig) -> Result<()> {
    config.validate()?;
    if config.directory.base_url.is_empty() {
        bail!("directory.base_url is not set");
    }
    config.ensure_directories()?;

    let (keys, generated) = NodeKeys::load_or_generate(&config.storage.key_file)?;
    if generated {
        info!("Generated new keys at {}", config.storage.key_file.display());
    }
    let directory: Arc<dyn DirectoryClient> = Arc::new(SupabaseDirectory::new(&config.directory)?);

    let (node, mut deliveries) = Node::start(config, keys, directory).await?;
    println!(
        "{} is online ({}). Commands: /add, /friends, /msg, /history, /status, /quit",
        node.username(),
        node.local_addr()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !run_command(&node, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
            Some(message) = deliveries.recv() => print_delivery(&message),
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Cannot listen for Ctrl-C: {e}");
                }
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down gracefully...");
    node.shutdown().await;
    Ok(())
}

/// Execute one interactive command; false means quit
async fn run_command(node: &Node, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let result = match command {
        "" => Ok(()),
        "/quit" | "/exit" => return false,
        "/add" => add_friend(node, rest).await,
        "/friends" => {
            list_friends(node).await;
            Ok(())
        }
        "/msg" => send_message(node, rest).await,
        "/history" => show_history(node, rest).await,
        "/status" => {
            show_status(node).await;
            Ok(())
        }
        other => Err(anyhow!("Unknown command {other}")),
    };
    if let Err(e) = result {
        warn!("{e}");
    }
    true
}

async fn add_friend(node: &Node, username: &str) -> Result<()> {
    if username.is_empty() {
        bail!("usage: /add <username>");
    }
    let friend = node.add_friend(username).await?;
    println!("✓ Added {} (fingerprint {})", friend.username, friend.fingerprint());
    Ok(())
}

async fn list_friends(node: &Node) {
    let friends = node.list_friends().await;
    if friends.is_empty() {
        println!("No friends yet. Use /add <username>.");
    }
    for friend in friends {
        println!(
            "  {:<16} {:<22} last seen {}",
            friend.username,
            friend.address,
            friend.last_seen.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
}

async fn send_message(node: &Node, args: &str) -> Result<()> {
    let Some((to, text)) = args.split_once(' ') else {
        bail!("usage: /msg <username> <text>");
    };
    let report = node.send_message(to, text.trim()).await?;
    println!("✓ Message to {to} {report}");
    Ok(())
}

async fn show_history(node: &Node, args: &str) -> Result<()> {
    let mut parts = args.split_whitespace();
    let peer = parts.next().ok_or_else(|| anyhow!("usage: /history <username> [limit]"))?;
    let limit = match parts.next() {
        Some(limit) => limit.parse().context("limit must be a number")?,
        None => DEFAULT_HISTORY_LIMIT,
    };
    for entry in node.history(peer, limit).await {
        let who = match entry.direction {
            MessageDirection::Sent => node.username(),
            MessageDirection::Received => entry.peer.as_str(),
        };
        println!("[{}] {who}: {}", entry.timestamp.format("%H:%M:%S"), entry.text);
    }
    Ok(())
}

async fn show_status(node: &Node) {
    let status = node.status().await;
    println!("Node Status");
    println!("===========");
    println!("Username:        {}", status.username);
    println!("Node ID:         {}", status.node_id);
    println!("Listening on:    {}", status.listen_address);
    println!("Advertised as:   {}", status.advertised_address);
    println!("Registered:      {}", status.registered);
    println!("Active sessions: {}", status.active_sessions);
    println!("Friends:         {}", status.friends);
    println!("Uptime:          {}s", status.uptime.as_secs());
}

fn print_delivery(message: &DeliveredMessage) {
    println!(
        "[{}] {}: {}",
        message.sent_at.format("%H:%M:%S"),
        message.from,
        message.text
    );
}
