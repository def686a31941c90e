//! detilerd — the detiler daemon.
//!
//! Opens the tile-state store, serves the REST API, and sweeps expired
//! keys in the background.
//!
//! # Usage
//!
//! ```text
//! detilerd serve --config /etc/detiler/detiler.toml --port 8080
//! detilerd config --in-memory
//! ```

mod sweeper;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use detiler_core::DetilerConfig;
use detiler_state::DetilerStore;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::sweeper::ExpirySweeper;

const DEFAULT_LOG_FILTER: &str = "info,detilerd=debug,detiler=debug";

#[derive(Parser)]
#[command(name = "detilerd", about = "detiler tile-state daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the API.
    Serve {
        #[command(flatten)]
        overrides: Overrides,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Flags that override `detiler.toml`.
#[derive(Args)]
struct Overrides {
    /// Path to detiler.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory.
    #[arg(long)]
    in_memory: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Overrides {
    fn resolve(self) -> anyhow::Result<DetilerConfig> {
        let mut config = match &self.config {
            Some(path) => DetilerConfig::from_file(path)?,
            None => DetilerConfig::default(),
        };
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(data_dir) = self.data_dir {
            config.store.data_dir = data_dir;
        }
        if self.in_memory {
            config.store.in_memory = true;
        }
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            overrides,
            log_format,
        } => {
            init_tracing(log_format);
            run(overrides.resolve()?).await
        }
        Command::Config { overrides } => {
            print!("{}", overrides.resolve()?.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: DetilerConfig) -> anyhow::Result<()> {
    info!("detiler daemon starting");

    if !config.store.in_memory {
        std::fs::create_dir_all(&config.store.data_dir)?;
    }
    let db_path = config.database_path();
    let store = DetilerStore::from_config(&db_path, &config.store, &config.query)?;
    info!(
        path = ?db_path,
        in_memory = config.store.in_memory,
        "store ready"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let sweeper = ExpirySweeper::new(
        store.engine.clone(),
        Duration::from_secs(config.store.purge_interval_secs.max(1)),
    );
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = detiler_api::build_router(store);
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;

    info!(%addr, "API server starting");

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = sweeper_handle.await;

    info!("detiler daemon stopped");
    Ok(())
}
