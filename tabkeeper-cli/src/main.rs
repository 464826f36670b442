//! Tabkeeper CLI: inspect and sync local add-on data outside the browser.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::Workspace;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabkeeper_core::remote::HttpRemoteClient;
use tabkeeper_core::{platform, SqliteStore, SystemClock, TabkeeperConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Tabkeeper CLI - local data, sealing and sync for the Tabkeeper add-ons
#[derive(Parser)]
#[command(name = "tabkeeper", version)]
#[command(about = "Local data, sealing and sync for the Tabkeeper add-ons", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Relay URL override
    #[arg(long, global = true)]
    relay_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the config file, data directory and sealing key
    Init {
        /// Also create an account on the relay and store its token
        #[arg(long)]
        register: bool,
    },

    /// Store an existing relay account token
    SignIn {
        token: String,
    },

    /// Forget the stored relay account token
    SignOut,

    /// Run one sync cycle now
    Sync,

    /// Show per-collection counts and sync state
    Status,

    /// Seal a JSON file (e.g. a cookie export) with the local key
    Seal {
        input: PathBuf,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Open a file produced by `seal`
    Open {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Export every local collection as a sync snapshot
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Register the native messaging host with Chrome
    InstallManifest {
        /// Extension id allowed to connect (repeatable)
        #[arg(long = "extension-id", required = true)]
        extension_ids: Vec<String>,

        /// Host binary path (defaults to tabkeeper-host next to this binary)
        #[arg(long)]
        host_path: Option<PathBuf>,

        /// Manifest directory override
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs on stderr so command output can be piped
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(platform::get_default_config_path);
    let mut config = TabkeeperConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(relay_url) = cli.relay_url {
        config.relay_url = relay_url;
    }

    if let Commands::InstallManifest {
        extension_ids,
        host_path,
        dir,
    } = &cli.command
    {
        let host_path = match host_path {
            Some(path) => path.clone(),
            None => std::env::current_exe()?
                .with_file_name(platform::get_binary_name("tabkeeper-host")),
        };
        let dir = match dir {
            Some(dir) => dir.clone(),
            None => platform::get_chrome_native_messaging_dir()
                .context("no native messaging directory known for this platform")?,
        };
        let path = commands::install_manifest(&dir, &host_path, extension_ids)?;
        println!("Installed {}", path.display());
        return Ok(());
    }

    platform::ensure_dir(&config.data_dir)?;
    let backend = Arc::new(SqliteStore::open(config.store_path())?);
    let workspace = Workspace::open(&config, backend, Arc::new(SystemClock)).await?;

    match cli.command {
        Commands::Init { register } => {
            if commands::write_default_config(&config_path, &config)? {
                println!("Wrote {}", config_path.display());
            }
            println!("Data directory: {}", config.data_dir.display());

            if register {
                let client = HttpRemoteClient::new(&config.relay_url, config.sync.request_timeout())?;
                let credentials = client.create_account().await?;
                workspace.account.save_token(&credentials.token).await?;
                info!(account_id = %credentials.account_id, "Registered relay account");
                println!("Registered account {}", credentials.account_id);
            }
        }
        Commands::SignIn { token } => {
            workspace.account.save_token(token.trim()).await?;
            println!("Signed in");
        }
        Commands::SignOut => {
            workspace.account.clear().await?;
            println!("Signed out");
        }
        Commands::Sync => {
            let remote = Arc::new(HttpRemoteClient::new(
                &config.relay_url,
                config.sync.request_timeout(),
            )?);
            let report = commands::sync_once(&workspace, remote, &config).await?;
            print_json(&report, None)?;
        }
        Commands::Status => {
            print_json(&commands::status(&workspace).await?, None)?;
        }
        Commands::Seal { input, output } => {
            let blob = commands::seal(workspace.crypto(), &input)?;
            print_json(&blob, output.as_deref())?;
        }
        Commands::Open { input, output } => {
            let data = commands::open(workspace.crypto(), &input)?;
            print_json(&data, output.as_deref())?;
        }
        Commands::Export { output } => {
            let snapshot = commands::export(&workspace).await?;
            print_json(&snapshot, output.as_deref())?;
        }
        Commands::InstallManifest { .. } => {}
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?
        }
        None => println!("{}", json),
    }
    Ok(())
}
