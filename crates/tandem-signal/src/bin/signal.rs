//! Tandem Signal Server
//!
//! WebSocket matchmaking and signaling relay for two-party sessions.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, or the user config file if present
//! tandem-signal --port 8080
//!
//! # Explicit config with JSON logs
//! tandem-signal --config /etc/tandem/signal.toml --json
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tandem_core::Config;
use tandem_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "tandem-signal")]
#[command(about = "Tandem matchmaking and signaling server")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "TANDEM_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "TANDEM_BIND")]
    bind: Option<String>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of endpoints waiting for a partner
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Per-message relay timeout in milliseconds
    #[arg(long)]
    relay_timeout_ms: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load(),
    };

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = &args.bind {
        config.server.bind = bind
            .parse()
            .with_context(|| format!("invalid bind address {}", bind))?;
    }
    if let Some(capacity) = args.queue_capacity {
        config.matchmaking.queue_capacity = capacity;
    }
    if let Some(timeout_ms) = args.relay_timeout_ms {
        config.relay.send_timeout_ms = timeout_ms;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json);

    let config = load_config(&args)?;
    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let addr = SocketAddr::new(config.server.bind, config.server.port);
    info!("Starting Tandem Signal Server");
    info!(
        "Matchmaking on {}, signaling on {}, queue capacity {}",
        config.server.matchmaking_path,
        config.server.signaling_path,
        config.matchmaking.queue_capacity
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let server = SignalServer::new(config);
    server
        .run(listener, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C");
            }
        })
        .await?;

    // Give sessions a moment to send their going-away close frames
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    Ok(())
}
