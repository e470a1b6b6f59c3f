//! # socketry
//!
//! socketry server binary: loads settings, initialises logging, maps the
//! demo chat handler and serves until ctrl-c.

#![deny(unsafe_code)]

mod chat;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use socketry_server::SocketServer;
use socketry_settings::SocketrySettings;

use crate::chat::ChatHandler;
use crate::logging::LogFormat;

/// How long open connections get to close after ctrl-c.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// socketry WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "socketry", about = "Real-time messaging server")]
struct Cli {
    /// Settings file (defaults to `~/.socketry/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn load_settings(&self) -> Result<SocketrySettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(socketry_settings::settings_path);
        let mut settings = socketry_settings::load_settings_from_path(&path)
            .context("Failed to load settings")?;
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    logging::init_subscriber(&args.log_level, args.log_format);

    let settings = args.load_settings()?;
    tracing::info!(
        heartbeat_ms = settings.heartbeat.interval_ms,
        try_times = settings.heartbeat.try_times,
        "settings loaded"
    );

    let mut server = SocketServer::new(settings);
    let _ = server.map::<ChatHandler>("/chat");

    let (addr, handle) = server.listen().await.context("Failed to bind")?;
    tracing::info!(%addr, "socketry ready, chat at ws://{addr}/chat");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    if !server
        .shutdown()
        .drain(server.scopes(), Some(DRAIN_TIMEOUT))
        .await
    {
        tracing::warn!("some connections did not close in time");
    }
    let _ = handle.await;
    Ok(())
}
