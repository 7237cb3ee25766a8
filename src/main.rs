//! Waypoint relay
//!
//! Run with: `waypoint [DEVICE_PORT] [WEB_PORT]`
//!
//! Ports, store and logging come from the config file, then `WAYPOINT_*`
//! environment variables, then command-line flags. `RUST_LOG` overrides the
//! configured log level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waypoint::config::generate_default_config;
use waypoint::{
    live, open_store, BatchedWriter, Config, ConnectionServer, DeviceServer, DispatchHub,
    LiveHub, LiveState, LoggingConfig,
};

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Relay GPS updates from devices to live viewers and a backing store")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Port devices connect to
    device_port: Option<u16>,

    /// Port for the live websocket channel
    web_port: Option<u16>,

    /// Config file (default: search standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store URI (sqlite://<path>, sqlite::memory:, memory://)
    #[arg(long)]
    store: Option<String>,

    /// Seconds between batched writes
    #[arg(long)]
    flush_interval: Option<u64>,

    /// Interface to bind both listeners on
    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the default config file
    PrintConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::PrintConfig { output }) = cli.command {
        let content = generate_default_config();
        match output {
            Some(path) => {
                std::fs::write(&path, content)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            None => print!("{}", content),
        }
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    init_logging(&config.logging);

    tracing::info!("Starting Waypoint v{}", env!("CARGO_PKG_VERSION"));
    run(config).await
}

fn resolve_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.device_port {
        config.server.device_port = port;
    }
    if let Some(port) = cli.web_port {
        config.server.web_port = port;
    }
    if let Some(uri) = &cli.store {
        config.store.uri = uri.clone();
    }
    if let Some(secs) = cli.flush_interval {
        config.store.flush_interval_secs = secs;
    }

    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("waypoint={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = open_store(&config.store.uri)?;
    let writer = Arc::new(BatchedWriter::new(store, config.store.writer_config()));
    if let Err(e) = writer.connect().await {
        tracing::warn!(
            uri = %config.store.uri,
            error = %e,
            "Store unavailable, buffering until it comes back"
        );
    }

    let live_hub = Arc::new(LiveHub::default());
    let hub = Arc::new(DispatchHub::new());
    hub.register(writer.clone());
    hub.register(live_hub.clone());

    let devices = Arc::new(DeviceServer::new(Arc::clone(&hub)));
    let server = ConnectionServer::bind(config.server.device_addr(), devices)
        .await
        .context("binding device port")?;
    server.start();
    tracing::info!("Accepting devices on {}", server.local_addr());

    let shutdown = CancellationToken::new();
    let flush_task = writer.start_background_flush(shutdown.child_token());

    let web_addr = config.server.web_addr();
    let web_listener = TcpListener::bind(&web_addr)
        .await
        .with_context(|| format!("binding web port {}", web_addr))?;
    let live_task = tokio::spawn(live::serve(
        web_listener,
        LiveState::new(live_hub, Arc::clone(&writer)),
        shutdown.child_token(),
    ));

    shutdown_signal().await;

    server.stop().await;
    shutdown.cancel();

    if let Err(e) = flush_task.await {
        tracing::error!("Flush task failed: {}", e);
    }
    match live_task.await {
        Ok(Err(e)) => tracing::error!("Live channel failed: {}", e),
        Err(e) => tracing::error!("Live channel task failed: {}", e),
        Ok(Ok(())) => {}
    }

    writer.disconnect().await;

    let stats = writer.stats();
    tracing::info!(
        appended = stats.appended,
        flushed = stats.flushed,
        pending = stats.pending,
        "Waypoint shutdown complete"
    );
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
