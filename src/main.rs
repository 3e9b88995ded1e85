//! Trellis server
//!
//! Run with: cargo run -- --config config.toml
//!
//! Configuration is read from `--config`, or the first of
//! `~/.config/trellis/config.toml`, `/etc/trellis/config.toml` and
//! `./config.toml`, then overridden by `TRELLIS_*` environment variables.
//! `RUST_LOG` overrides the configured log level.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

use trellis::config::{generate_default_config, Config};
use trellis::lifecycle::Orchestrator;
use trellis::modules::PresenceModule;
use trellis::{logging, server, topics};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Modular web application runtime")]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides server.addr
    #[arg(long)]
    addr: Option<String>,

    /// Print a default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }

    logging::init_logging(&config.logging)?;
    tracing::info!("Starting Trellis v{}", env!("CARGO_PKG_VERSION"));
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    let config = Arc::new(config);
    let timeout = config.server.shutdown_timeout();
    let orchestrator = Orchestrator::builder(Arc::clone(&config))
        .module(PresenceModule::default())
        .build()?;
    if topics::install_default(Arc::clone(orchestrator.topics())).is_err() {
        tracing::warn!("A default topic manager was already installed");
    }

    let router = match orchestrator.start().await {
        Ok(router) => router,
        Err(e) => {
            tracing::error!(error = %e, "Start-up failed");
            orchestrator.shutdown(timeout).await;
            return Err(e.into());
        }
    };

    let listener = match TcpListener::bind(&config.server.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %config.server.addr, error = %e, "Failed to bind");
            orchestrator.shutdown(timeout).await;
            return Err(e.into());
        }
    };

    let served = server::serve(
        listener,
        router,
        server::shutdown_signal(orchestrator.token()),
    )
    .await;

    orchestrator.shutdown(timeout).await;
    served?;

    tracing::info!("Trellis stopped");
    Ok(())
}
