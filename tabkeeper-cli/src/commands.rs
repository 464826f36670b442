//! Command implementations, kept free of argument parsing so they can be
//! driven from tests against an in-memory store.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabkeeper_core::crypto::load_or_create_key;
use tabkeeper_core::store::CRYPTO_NAMESPACE;
use tabkeeper_core::{
    platform, AccountStore, Clock, Collection, CollectionStore, CryptoBox, EncryptedBlob,
    LocalStore, Namespaced, RemoteClient, SyncOrchestrator, SyncPayload, SyncReason, SyncReport,
    TabkeeperConfig,
};
use tracing::info;

/// Local data opened with its sealing key.
pub struct Workspace {
    pub store: Arc<CollectionStore>,
    pub account: AccountStore,
    clock: Arc<dyn Clock>,
}

impl Workspace {
    pub async fn open(
        config: &TabkeeperConfig,
        backend: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let key = load_or_create_key(&Namespaced::new(backend.clone(), CRYPTO_NAMESPACE))
            .await
            .context("loading sealing key")?;
        let crypto = CryptoBox::new(key);

        Ok(Self {
            account: AccountStore::new(backend.clone(), crypto.clone()),
            store: Arc::new(CollectionStore::new(
                backend,
                crypto,
                config.sync.sealed_collections.clone(),
                clock.clone(),
            )),
            clock,
        })
    }

    pub fn crypto(&self) -> &CryptoBox {
        self.store.crypto()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    pub active: usize,
    pub tombstones: usize,
    pub integrity_failures: Vec<String>,
    pub rejected: usize,
    pub last_sync_time: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub signed_in: bool,
    pub collections: BTreeMap<Collection, CollectionSummary>,
}

/// Write the default config if none exists. Returns whether a file was written.
pub fn write_default_config(path: &Path, config: &TabkeeperConfig) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        platform::ensure_dir(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

pub async fn status(workspace: &Workspace) -> Result<StatusReport> {
    let mut collections = BTreeMap::new();
    for (collection, read) in workspace.store.read_all().await? {
        let tombstones = read.records.iter().filter(|r| r.is_tombstone()).count();
        let state = workspace.store.sync_state(collection).await?;
        collections.insert(
            collection,
            CollectionSummary {
                active: read.records.len() - tombstones,
                tombstones,
                integrity_failures: read.integrity_failures,
                rejected: read.rejected,
                last_sync_time: state.last_sync_time,
            },
        );
    }

    Ok(StatusReport {
        signed_in: workspace.account.load_token().await?.is_some(),
        collections,
    })
}

/// Run one sync cycle with the stored account token.
pub async fn sync_once(
    workspace: &Workspace,
    remote: Arc<dyn RemoteClient>,
    config: &TabkeeperConfig,
) -> Result<SyncReport> {
    let Some(token) = workspace.account.load_token().await? else {
        bail!("not signed in; run `tabkeeper sign-in <token>` or `tabkeeper init --register`");
    };

    let sync = SyncOrchestrator::new(
        workspace.store.clone(),
        remote,
        workspace.clock.clone(),
        &config.sync,
    );
    sync.set_auth_token(Some(token));
    let outcome = sync.trigger_sync(SyncReason::UserRequested).await;
    sync.shutdown();

    let report = outcome?;
    info!(
        pushed = report.pushed.len(),
        push_failures = report.push_failures.len(),
        "Sync finished"
    );
    Ok(report)
}

/// Everything stored locally, tombstones included, as a wire snapshot.
pub async fn export(workspace: &Workspace) -> Result<SyncPayload> {
    let collections = workspace
        .store
        .read_all()
        .await?
        .into_iter()
        .map(|(collection, read)| (collection, read.records))
        .collect();
    Ok(SyncPayload::from_collections(&collections))
}

pub fn seal(crypto: &CryptoBox, input: &Path) -> Result<EncryptedBlob> {
    let data: Value = read_json(input)?;
    Ok(crypto.seal_json(&data)?)
}

pub fn open(crypto: &CryptoBox, input: &Path) -> Result<Value> {
    let blob: EncryptedBlob = read_json(input)?;
    crypto
        .open_json(&blob)
        .with_context(|| format!("opening {}", input.display()))
}

/// Write the native messaging manifest for `host_binary`. Returns its path.
pub fn install_manifest(
    dir: &Path,
    host_binary: &Path,
    extension_ids: &[String],
) -> Result<PathBuf> {
    if extension_ids.is_empty() {
        bail!("at least one extension id is required");
    }
    let origins: Vec<String> = extension_ids
        .iter()
        .map(|id| format!("chrome-extension://{}/", id.trim_matches('/')))
        .collect();
    let manifest = platform::native_messaging_manifest(host_binary, &origins);

    platform::ensure_dir(dir)?;
    let path = dir.join(format!("{}.json", platform::NATIVE_HOST_NAME));
    std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}
