//! Binary entrypoint for the Meshgate CLI.
//!
//! Commands:
//! - `start` - run the gateway until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `nodes [--json]` - list nodes heard so far
//! - `send <message…>` - broadcast one message on the channel and exit
//! - `dm <node> <message…>` - direct message a node by `!hex` id or known name
//! - `generate-id` - print a random node id for `meshtastic.gateway_id`
//!
//! See the library crate docs for module‑level details: `meshgate::`.
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use meshgate::config::Config;
use meshgate::gateway::MeshGateway;
use meshgate::meshtastic::{self, BROADCAST_ADDR};
use meshgate::sink::LogSink;
use meshgate::storage::NodeStore;
use meshgate::transport::{MqttTransport, Transport};

const CLI_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "A gateway between Meshtastic MQTT channels and a message sink")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List known nodes, most recently heard first
    Nodes {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Broadcast a message on the channel
    Send {
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Send a direct message to one node
    Dm {
        /// Node id (!abcd1234) or long/short name
        node: String,
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// Generate a random node id for this gateway
    GenerateId,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            info!("Starting Meshgate v{}", env!("CARGO_PKG_VERSION"));
            run_gateway(config).await?;
        }
        Commands::Init { force } => {
            init_logging(None, cli.verbose);
            if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                bail!("{} already exists (use --force to overwrite)", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            println!(
                "Wrote {}. Set meshtastic.gateway_id (try `meshgate generate-id`) before starting.",
                cli.config
            );
        }
        Commands::Nodes { json } => {
            let config = load_config(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let store = NodeStore::open(&config.storage.db_path)?;
            let nodes = store.all_nodes()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
                return Ok(());
            }
            if nodes.is_empty() {
                println!("No nodes heard yet.");
            }
            for node in nodes {
                let position = match (node.latitude, node.longitude) {
                    (Some(lat), Some(lon)) => format!("{:.5},{:.5}", lat, lon),
                    _ => "-".to_string(),
                };
                println!(
                    "{}  {:<24} {:<6} {}  {}",
                    meshtastic::fmt_node_id(node.node_id),
                    node.long_name.as_deref().unwrap_or("-"),
                    node.short_name.as_deref().unwrap_or("-"),
                    node.last_heard.format("%Y-%m-%d %H:%M:%S UTC"),
                    position
                );
            }
        }
        Commands::Send { message } => {
            let config = load_config(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            send_once(&config, BROADCAST_ADDR, &message.join(" ")).await?;
        }
        Commands::Dm { node, message } => {
            let config = load_config(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let store = NodeStore::open(&config.storage.db_path)?;
            let dest = resolve_node(&store, &node)?;
            send_once(&config, dest, &message.join(" ")).await?;
        }
        Commands::GenerateId => {
            let id = loop {
                let id = meshtastic::new_packet_id();
                if id != BROADCAST_ADDR {
                    break id;
                }
            };
            println!("{}", meshtastic::fmt_node_id(id));
        }
    }

    Ok(())
}

async fn load_config(path: &str) -> Result<Config> {
    Config::load(path)
        .await
        .with_context(|| format!("run `meshgate init -c {}` to create one", path))
}

fn resolve_node(store: &NodeStore, node: &str) -> Result<u32> {
    if node.starts_with('!') {
        return meshtastic::parse_node_id(node)
            .with_context(|| format!("invalid node id '{}'", node));
    }
    match store.lookup_id(node)? {
        Some(id) => Ok(id),
        None => bail!("no known node named '{}' (see `meshgate nodes`)", node),
    }
}

async fn run_gateway(config: Config) -> Result<()> {
    let settings = config.gateway_settings()?;
    let store = Arc::new(NodeStore::open(&config.storage.db_path)?);
    let transport = Arc::new(MqttTransport::connect(&config.mqtt));
    let sink = Arc::new(LogSink::new());
    let (gateway, outbound_rx) = MeshGateway::new(settings, transport, store, sink);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    gateway.run(outbound_rx, shutdown_rx).await
}

/// Connect, publish one message (fragmented if needed) and disconnect.
/// Relay flags do not apply to the CLI.
async fn send_once(config: &Config, destination: u32, text: &str) -> Result<()> {
    let settings = config.gateway_settings()?;
    let store = Arc::new(NodeStore::open_in_memory()?);
    let transport = Arc::new(MqttTransport::connect(&config.mqtt));
    if let Err(e) = transport.wait_connected(CLI_CONNECT_TIMEOUT).await {
        transport.close().await;
        return Err(e).context("could not reach MQTT broker");
    }
    let (gateway, _outbound_rx) =
        MeshGateway::new(settings, transport.clone(), store, Arc::new(LogSink::new()));
    let result = gateway.send_text(destination, text).await;
    transport.close().await;
    let parts = result?;
    println!(
        "Sent to {} in {} packet(s)",
        meshtastic::fmt_node_id(destination),
        parts
    );
    Ok(())
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);
    // rumqttc is chatty at debug
    if level == log::LevelFilter::Debug {
        builder.filter_module("rumqttc", log::LevelFilter::Info);
    }

    let log_file = config
        .and_then(|c| c.logging.file.as_deref())
        .filter(|path| !path.is_empty())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match log_file {
        Some(f) => {
            let file = std::sync::Mutex::new(f);
            // Foreground runs mirror the file to the console
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
