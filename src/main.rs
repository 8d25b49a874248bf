//! Binary entrypoint for the groundwave CLI.
//!
//! Commands:
//! - `start` - connect the radio (and the regional feed when enabled) and log events until Ctrl-C
//! - `init` - write a starter configuration file
//! - `send [--to <id>] [--channel <n>] <text>` - send one (possibly chunked) message and exit
//!
//! See the library crate docs for module-level details: `groundwave::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::time::Duration;
use tokio::sync::mpsc;

use groundwave::config::Config;
use groundwave::gateway::Gateway;
use groundwave::logutil::preview;
use groundwave::mesh::{forward_to, ConnectionState, MeshInterface, MeshMessage, MeshNode};

#[derive(Parser)]
#[command(name = "groundwave")]
#[command(about = "Mesh protocol ingestion layer for Meshtastic radios and regional MQTT feeds")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "groundwave.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log mesh events until interrupted
    Start,
    /// Write a default configuration file
    Init,
    /// Send one message and exit
    Send {
        /// Destination node id (!0a1b2c3d or 0x0a1b2c3d); omit to broadcast
        #[arg(short, long)]
        to: Option<String>,
        /// Channel index
        #[arg(long, default_value_t = 0)]
        channel: u32,
        /// Message text
        text: String,
    },
}

/// How often `start` logs a one-line status summary.
const STATUS_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                bail!("{} already exists; not overwriting", cli.config);
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Start => {
            let config = load_config(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting groundwave v{}", env!("CARGO_PKG_VERSION"));
            run(config).await?;
        }
        Commands::Send { to, channel, text } => {
            let config = load_config(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let gateway = Gateway::new(config)?;
            let mesh = gateway.mesh();
            if !mesh.connect().await {
                bail!("Could not connect to the radio");
            }
            let cfg = &gateway.config().mesh;
            let sent = mesh
                .send_chunked_message(
                    &text,
                    to.as_deref(),
                    channel,
                    cfg.max_message_length,
                    cfg.chunk_delay(),
                    true,
                )
                .await;
            mesh.disconnect().await;
            if !sent {
                bail!("Message was not sent");
            }
        }
    }

    Ok(())
}

async fn load_config(path: &str) -> Result<Config> {
    let mut config = Config::load(path).await?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    let gateway = Gateway::new(config)?;
    let mesh = gateway.mesh();

    let (msg_tx, mut msg_rx) = mpsc::channel::<MeshMessage>(256);
    let (node_tx, mut node_rx) = mpsc::channel::<MeshNode>(256);
    let (state_tx, mut state_rx) = mpsc::channel::<ConnectionState>(32);
    mesh.on_message(forward_to(msg_tx));
    mesh.on_node_update(forward_to(node_tx));
    mesh.on_connection_change(forward_to(state_tx));

    gateway.start().await?;

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    status.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown requested");
                break;
            }
            Some(msg) = msg_rx.recv() => {
                info!(
                    "[ch{}] {} {}: {}",
                    msg.channel,
                    if msg.is_direct { "DM" } else { "msg" },
                    msg.from_node.as_ref().map(|n| n.display_name()).unwrap_or(msg.from_id.as_str()),
                    preview(&msg.text)
                );
            }
            Some(node) = node_rx.recv() => {
                info!("Node {} ({}) updated", node.node_id, node.display_name());
            }
            Some(state) = state_rx.recv() => {
                if state == ConnectionState::Error {
                    warn!("Radio connection state: {}", state);
                } else {
                    info!("Radio connection state: {}", state);
                }
            }
            _ = status.tick() => {
                info!("Status: radio {} with {} nodes known", mesh.state(), mesh.get_all_nodes().len());
                if let Some(regional) = gateway.regional() {
                    let s = regional.get_stats();
                    info!(
                        "Status: regional {} ({} nodes, {} received, {} decoded, {} failed)",
                        if s.connected { "connected" } else { "disconnected" },
                        s.node_count,
                        s.messages_received,
                        s.decoded_ok,
                        s.decoded_fail
                    );
                }
            }
        }
    }

    gateway.shutdown().await;
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground: mirror file output to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
