//! chathead-peer entry point.
//!
//! ```text
//! chathead-peer                          Serve on the configured port
//! chathead-peer --connect <host[:port]>  Join a server as a client
//! chathead-peer --config <path>          Load a custom config TOML
//! chathead-peer --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chathead_core::Role;
use chathead_peer::config::PeerConfig;
use chathead_peer::peer::Peer;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "chathead-peer", about = "Headless chathead video overlay peer")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "chathead-peer.toml")]
    config: PathBuf,

    /// Join this server as a client (overrides config).
    #[arg(long, conflicts_with = "listen")]
    connect: Option<String>,

    /// Serve on this address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Players per session, including the server (overrides config).
    #[arg(long)]
    max_players: Option<u32>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&PeerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = PeerConfig::load(&cli.config);
    if let Some(server) = cli.connect {
        config.network.role = Role::Client;
        config.network.address = server;
    }
    if let Some(addr) = cli.listen {
        config.network.role = Role::Server;
        config.network.address = addr;
    }
    if let Some(n) = cli.max_players {
        config.network.max_players = n;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("chathead-peer v{}", env!("CARGO_PKG_VERSION"));
    info!("role: {}", config.network.role);
    info!("port: {}", config.network.port);
    info!("capture: {}x{} @ {} fps", config.video.width, config.video.height, config.video.fps);

    let mut peer = Peer::start(&config)?;

    // This thread is the consumer: it owns the frame clock.
    let mut clock = tokio::time::interval(config.frame_clock());
    clock.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = clock.tick() => {
                peer.tick();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
        }
    }

    peer.shutdown();
    Ok(())
}
