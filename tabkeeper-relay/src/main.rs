//! `tabkeeper-relay`: per-account collection storage behind bearer tokens.
//!
//! Clients fetch a collection, merge on their side, and push the merged
//! result back as a full replacement.

mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod server;
mod storage;

use anyhow::Context;
use clap::Parser;
use config::RelayConfig;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tabkeeper-relay", version, about = "Sync endpoint for the Tabkeeper add-ons")]
struct Cli {
    /// TOML settings file; built-in defaults apply when it does not exist
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Address to bind, e.g. 0.0.0.0:8743
    #[arg(short, long)]
    listen: Option<String>,

    /// SQLite database file
    #[arg(short, long)]
    database: Option<PathBuf>,
}

impl Cli {
    /// Settings file merged with command-line overrides.
    fn resolve(self) -> anyhow::Result<RelayConfig> {
        let mut cfg = if self.config.exists() {
            RelayConfig::load(&self.config)
                .with_context(|| format!("reading {}", self.config.display()))?
        } else {
            warn!(path = %self.config.display(), "Settings file missing; built-in defaults apply");
            RelayConfig::default()
        };
        cfg.listen_addr = self.listen.unwrap_or(cfg.listen_addr);
        cfg.storage_path = self.database.unwrap_or(cfg.storage_path);
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Cli::parse().resolve()?;
    run(cfg).await
}

async fn run(cfg: RelayConfig) -> anyhow::Result<()> {
    let storage = storage::RelayStorage::open(&cfg.storage_path)
        .with_context(|| format!("opening {}", cfg.storage_path.display()))?;
    let state = server::AppState::new(storage, &cfg);
    let cleanup = cleanup::spawn_cleanup_task(state.clone(), cleanup::Retention::from(&cfg));

    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!(
        addr = %cfg.listen_addr,
        db = %cfg.storage_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Relay accepting connections"
    );

    axum::serve(listener, server::build_router(state, &cfg))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received; draining connections");
            }
        })
        .await?;

    cleanup.abort();
    info!("Relay stopped");
    Ok(())
}
