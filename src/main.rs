//! # coms
//!
//! Server binary: loads settings, installs logging, registers the built-in
//! handlers and serves `/ws` until Ctrl-C.

#![deny(unsafe_code)]

mod handlers;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coms_connection::{ConnectionConfig, HandlerRegistry, Hub};
use coms_core::logging;
use coms_server::{ComsServer, ServerConfig};
use coms_settings::ComsSettings;
use tracing::info;

/// Correlated request/response calls over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "coms", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept WebSocket connections and answer calls.
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.coms/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl ServeArgs {
    fn apply(&self, settings: &mut ComsSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(coms_settings::settings_path);
    let mut settings = coms_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);

    logging::init_subscriber(&settings.logging.level, settings.logging.format);

    let mut registry = HandlerRegistry::new();
    handlers::register_all(&mut registry);
    info!(actions = ?registry.actions(), "handlers registered");

    let hub = Hub::new(registry, ConnectionConfig::from(&settings.connection));
    let server = ComsServer::new(ServerConfig::from(&settings.server), hub);
    let (addr, handle) = server.listen().await.context("Failed to start server")?;
    info!(%addr, "coms ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down");

    server.shutdown_gracefully(vec![handle], None).await;
    info!("shutdown complete");
    Ok(())
}
