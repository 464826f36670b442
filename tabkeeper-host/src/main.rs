//! Tabkeeper native messaging host
//!
//! Launched by the browser. Reads length-prefixed JSON requests on stdin,
//! answers on stdout, and keeps the local collections in sync with the
//! relay in the background.

mod app;
mod handlers;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tabkeeper_core::remote::HttpRemoteClient;
use tabkeeper_core::{platform, SqliteStore, SystemClock, TabkeeperConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Origin used when the host is started by hand rather than by a browser.
const LOCAL_ORIGIN: &str = "local";

#[derive(Parser)]
#[command(name = "tabkeeper-host", version, about = "Tabkeeper native messaging host")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Relay URL override
    #[arg(long)]
    relay_url: Option<String>,

    /// Browsers pass the calling extension origin as a positional argument
    #[arg(hide = true)]
    origin: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to stderr: stdout carries native messaging frames
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    info!("Starting Tabkeeper host v{}", VERSION);

    let config_path = cli.config.unwrap_or_else(platform::get_default_config_path);
    let mut config = TabkeeperConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(relay_url) = cli.relay_url {
        config.relay_url = relay_url;
    }
    // The browser names the calling extension; every request on this
    // connection is attributed to it.
    let origin = cli
        .origin
        .first()
        .cloned()
        .unwrap_or_else(|| LOCAL_ORIGIN.to_string());
    info!(%origin, "Serving native messaging connection");

    platform::ensure_dir(&config.data_dir)?;
    let backend = Arc::new(SqliteStore::open(&config.store_path())?);
    let remote = Arc::new(HttpRemoteClient::new(
        &config.relay_url,
        config.sync.request_timeout(),
    )?);

    let host = app::Host::start(&config, backend, remote, Arc::new(SystemClock)).await?;

    let served = app::serve(&host.gateway, &origin, tokio::io::stdin(), tokio::io::stdout()).await;

    host.shutdown();
    served?;
    Ok(())
}
