//! Host composition root and native messaging loop.

use crate::handlers::register_handlers;
use serde_json::Value;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tabkeeper_core::crypto::load_or_create_key;
use tabkeeper_core::gateway::native_messaging::{
    encode_frame, read_raw_frame, write_raw_frame, InboundFrame,
};
use tabkeeper_core::gateway::{
    Envelope, ErrorCode, MessageGateway, Response, ResponseEnvelope,
};
use tabkeeper_core::store::CRYPTO_NAMESPACE;
use tabkeeper_core::{
    AccountStore, Clock, CollectionStore, CryptoBox, LocalStore, Namespaced, RemoteClient, SyncOrchestrator,
    SyncScheduler, TabkeeperConfig,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Host {
    pub gateway: Arc<MessageGateway>,
    pub sync: SyncOrchestrator,
    scheduler: SyncScheduler,
    sweeper: JoinHandle<()>,
}

impl Host {
    /// Wire the store, sealing key, orchestrator and gateway together and
    /// start the background timers.
    pub async fn start(
        config: &TabkeeperConfig,
        backend: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let key_store = Namespaced::new(backend.clone(), CRYPTO_NAMESPACE);
        let key = load_or_create_key(&key_store).await?;
        let crypto = CryptoBox::new(key);

        let account = AccountStore::new(backend.clone(), crypto.clone());
        let store = Arc::new(CollectionStore::new(
            backend,
            crypto,
            config.sync.sealed_collections.clone(),
            clock.clone(),
        ));
        let sync = SyncOrchestrator::new(store, remote, clock.clone(), &config.sync);

        match account.load_token().await {
            Ok(Some(token)) => {
                info!("Restored relay account");
                sync.set_auth_token(Some(token));
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Stored account token unreadable; signed out"),
        }

        let mut gateway = MessageGateway::new(&config.gateway, clock);
        register_handlers(&mut gateway, sync.clone(), account);
        let gateway = Arc::new(gateway);

        let scheduler = SyncScheduler::spawn(sync.clone(), config.sync.interval());
        let sweeper = gateway
            .clone()
            .spawn_sweeper(Duration::from_millis(config.gateway.sweep_interval_ms));

        info!(
            sealed = ?config.sync.sealed_collections,
            "Host started"
        );
        Ok(Self {
            gateway,
            sync,
            scheduler,
            sweeper,
        })
    }

    pub fn shutdown(mut self) {
        self.scheduler.stop();
        self.sync.shutdown();
        self.sweeper.abort();
    }
}

/// Serve framed requests from `origin` until the browser closes the
/// stream. Frames are handled one at a time and every frame gets an answer;
/// only I/O failures end the loop early. Returns the number of requests
/// answered.
pub async fn serve<R, W>(
    gateway: &MessageGateway,
    origin: &str,
    mut reader: R,
    mut writer: W,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut answered = 0;

    while let Some(frame) = read_raw_frame(&mut reader).await? {
        let response = match frame {
            InboundFrame::Oversized(length) => {
                warn!(length, "Discarded oversized frame");
                rejection(None, format!("frame of {} bytes exceeds limit", length))
            }
            InboundFrame::Body(body) => match serde_json::from_slice::<Value>(&body) {
                Ok(message) => dispatch(gateway, origin, message).await,
                Err(e) => {
                    warn!(error = %e, "Undecodable frame");
                    rejection(None, format!("malformed frame: {}", e))
                }
            },
        };

        let body = match encode_frame(&response) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Response not deliverable");
                encode_frame(&ResponseEnvelope {
                    request_id: response.request_id,
                    response: Response::error(ErrorCode::Internal, "response too large"),
                })?
            }
        };
        write_raw_frame(&mut writer, &body).await?;
        answered += 1;
    }

    info!(answered, "Browser closed the native messaging stream");
    Ok(answered)
}

async fn dispatch(gateway: &MessageGateway, origin: &str, message: Value) -> ResponseEnvelope {
    let request_id = message
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string);

    match serde_json::from_value::<Envelope>(message) {
        Ok(envelope) => {
            debug!(sender = %envelope.sender, msg_type = %envelope.request.msg_type, "Request");
            gateway.handle_envelope(origin, envelope).await
        }
        Err(e) => {
            warn!(error = %e, "Malformed request envelope");
            rejection(request_id, format!("malformed request: {}", e))
        }
    }
}

fn rejection(request_id: Option<String>, message: String) -> ResponseEnvelope {
    ResponseEnvelope {
        request_id,
        response: Response::error(ErrorCode::Validation, message),
    }
}
