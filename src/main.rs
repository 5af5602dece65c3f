//! # aqueduct
//!
//! Event bridge binary: loads settings, starts the websocket server and
//! bridges each client to its own backend connection.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use aqueduct_backend::{MemoryConnector, MemoryHub, PgConnector};
use aqueduct_core::backend::Connector;
use aqueduct_logging::LogFormat;
use aqueduct_server::{BridgeServer, ServerConfig};
use aqueduct_settings::Settings;

/// How long to wait for open connections after ctrl-c.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Websocket bridge to PostgreSQL notifications and the endpoint API.
#[derive(Parser, Debug)]
#[command(name = "aqueduct", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge server.
    Serve(ServeArgs),
    /// Print the effective settings (password redacted) and exit.
    Config {
        /// Settings file (default `~/.aqueduct/settings.json`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Settings file (default `~/.aqueduct/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the in-process backend instead of PostgreSQL.
    #[arg(long)]
    memory: bool,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter (overrides settings; `RUST_LOG` wins over both).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

fn load(config: Option<PathBuf>) -> Result<Settings> {
    let path = config.unwrap_or_else(aqueduct_settings::settings_path);
    aqueduct_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Config { config } => {
            let settings = load(config)?;
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
            Ok(())
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut settings = load(args.config)?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }
    if args.json_logs {
        settings.logging.format = LogFormat::Json;
    }

    aqueduct_logging::init_subscriber(&settings.logging.level, settings.logging.format);
    let metrics = match aqueduct_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let config = ServerConfig::from_settings(&settings);
    if args.memory {
        serve_with(config, MemoryConnector::new(MemoryHub::new()), metrics).await
    } else {
        serve_with(config, PgConnector::from_settings(&settings.database), metrics).await
    }
}

async fn serve_with<C: Connector>(
    config: ServerConfig,
    connector: C,
    metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
) -> Result<()> {
    let server = BridgeServer::new(config, connector, metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;

    tracing::info!("aqueduct listening on ws://{addr}{}", server.config().ws_path);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server
        .shutdown()
        .graceful_shutdown(Some(SHUTDOWN_TIMEOUT))
        .await;
    let _ = handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
