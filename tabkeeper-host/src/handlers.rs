//! Request handlers registered on the message gateway.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tabkeeper_core::gateway::{Access, MessageGateway};
use tabkeeper_core::{
    AccountStore, Collection, EncryptedBlob, Record, Result, SyncOrchestrator, SyncReason, TabkeeperError,
};
use tracing::{info, warn};

#[derive(Deserialize)]
struct SignIn {
    token: String,
}

#[derive(Deserialize)]
struct CollectionQuery {
    collection: Collection,
}

#[derive(Deserialize)]
struct SaveRecord {
    collection: Collection,
    #[serde(default)]
    id: Option<String>,
    record: Map<String, Value>,
}

#[derive(Deserialize)]
struct DeleteRecord {
    collection: Collection,
    id: String,
}

#[derive(Deserialize)]
struct SealPayload {
    data: Value,
}

#[derive(Deserialize)]
struct OpenPayload {
    blob: EncryptedBlob,
}

fn parse<T: DeserializeOwned>(payload: Option<Value>) -> Result<T> {
    let payload = payload.ok_or_else(|| TabkeeperError::Validation("missing payload".to_string()))?;
    serde_json::from_value(payload)
        .map_err(|e| TabkeeperError::Validation(format!("invalid payload: {}", e)))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| TabkeeperError::Validation(e.to_string()))
}

/// Register every host request type.
pub fn register_handlers(
    gateway: &mut MessageGateway,
    sync: SyncOrchestrator,
    account: AccountStore,
) {
    let s = sync.clone();
    gateway.register("getSyncStatus", Access::Open, move |_ctx, _payload| {
        let sync = s.clone();
        async move {
            Ok(json!({
                "signedIn": sync.is_signed_in(),
                "status": to_json(&sync.status())?,
            }))
        }
    });

    let s = sync.clone();
    gateway.register("syncNow", Access::TokenRequired, move |ctx, _payload| {
        let sync = s.clone();
        async move {
            info!(sender = %ctx.sender, "Sync requested");
            let report = sync.trigger_sync(SyncReason::UserRequested).await?;
            to_json(&report)
        }
    });

    let s = sync.clone();
    let a = account.clone();
    gateway.register("signIn", Access::TokenRequired, move |_ctx, payload| {
        let sync = s.clone();
        let account = a.clone();
        async move {
            let SignIn { token } = parse(payload)?;
            if token.trim().is_empty() {
                return Err(TabkeeperError::Validation("empty account token".to_string()));
            }
            account.save_token(&token).await?;
            sync.set_auth_token(Some(token));
            // The UI follows progress through getSyncStatus.
            tokio::spawn(async move {
                if let Err(e) = sync.trigger_sync(SyncReason::Authenticated).await {
                    warn!(error = %e, "Initial sync after sign-in failed");
                }
            });
            Ok(json!({ "signedIn": true }))
        }
    });

    let s = sync.clone();
    gateway.register("signOut", Access::TokenRequired, move |_ctx, _payload| {
        let sync = s.clone();
        let account = account.clone();
        async move {
            account.clear().await?;
            sync.sign_out();
            Ok(json!({ "signedIn": false }))
        }
    });

    let s = sync.clone();
    gateway.register("listRecords", Access::Open, move |_ctx, payload| {
        let sync = s.clone();
        async move {
            let CollectionQuery { collection } = parse(payload)?;
            let records = sync.store().list_active(collection).await?;
            Ok(Value::Array(records.iter().map(Record::to_value).collect()))
        }
    });

    let s = sync.clone();
    gateway.register("saveRecord", Access::TokenRequired, move |_ctx, payload| {
        let sync = s.clone();
        async move {
            let SaveRecord {
                collection,
                id,
                record: mut fields,
            } = parse(payload)?;
            if let Some(id) = id {
                fields.insert("id".to_string(), Value::String(id));
            }
            // Validates the shape and derives composite ids; client-sent
            // metadata is replaced by the store's own stamps.
            let parsed = Record::from_value(Value::Object(fields), collection)?;
            let saved = sync
                .store()
                .upsert(collection, &parsed.id, parsed.payload)
                .await?;
            Ok(saved.to_value())
        }
    });

    let s = sync.clone();
    gateway.register("deleteRecord", Access::TokenRequired, move |_ctx, payload| {
        let sync = s.clone();
        async move {
            let DeleteRecord { collection, id } = parse(payload)?;
            let tombstone = sync.store().delete(collection, &id).await?;
            Ok(tombstone.to_value())
        }
    });

    let s = sync.clone();
    gateway.register("sealPayload", Access::TokenRequired, move |_ctx, payload| {
        let sync = s.clone();
        async move {
            let SealPayload { data } = parse(payload)?;
            let blob = sync.store().crypto().seal_json(&data)?;
            to_json(&blob)
        }
    });

    let s = sync;
    gateway.register("openPayload", Access::TokenRequired, move |_ctx, payload| {
        let sync = s.clone();
        async move {
            let OpenPayload { blob } = parse(payload)?;
            let data: Value = sync.store().crypto().open_json(&blob)?;
            Ok(data)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tabkeeper_core::config::{GatewaySettings, SyncSettings};
    use tabkeeper_core::gateway::{ErrorCode, Request, RequestContext, Response, GET_TOKEN};
    use tabkeeper_core::remote::{FetchResponse, HeartbeatResponse, PushResponse};
    use tabkeeper_core::{
        CollectionStore, CryptoBox, ManualClock, MemoryStore, RemoteClient, RemoteError,
        SealingKey,
    };

    #[derive(Default)]
    struct EmptyRemote {
        pushes: AtomicUsize,
    }

    #[async_trait]
    impl RemoteClient for EmptyRemote {
        async fn fetch(
            &self,
            _collection: Collection,
            _auth: &str,
        ) -> std::result::Result<FetchResponse, RemoteError> {
            Ok(FetchResponse::default())
        }

        async fn push(
            &self,
            _collection: Collection,
            records: &[Record],
            _auth: &str,
        ) -> std::result::Result<PushResponse, RemoteError> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(PushResponse {
                accepted: records.len(),
            })
        }

        async fn heartbeat(&self, _auth: &str) -> std::result::Result<HeartbeatResponse, RemoteError> {
            Ok(HeartbeatResponse { last_seen: 0 })
        }
    }

    fn popup() -> RequestContext {
        RequestContext::new("chrome-extension://tabkeeper/", "popup")
    }

    fn host() -> (MessageGateway, SyncOrchestrator, Arc<EmptyRemote>) {
        host_with(Arc::new(MemoryStore::new()))
    }

    fn host_with(backend: Arc<MemoryStore>) -> (MessageGateway, SyncOrchestrator, Arc<EmptyRemote>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let crypto = CryptoBox::new(SealingKey::generate());
        let account = AccountStore::new(backend.clone(), crypto.clone());
        let store = Arc::new(CollectionStore::new(
            backend,
            crypto,
            vec![Collection::ActivityLogs],
            clock.clone(),
        ));
        let remote = Arc::new(EmptyRemote::default());
        let sync = SyncOrchestrator::new(store, remote.clone(), clock.clone(), &SyncSettings::default());

        let mut gateway = MessageGateway::new(&GatewaySettings::default(), clock);
        register_handlers(&mut gateway, sync.clone(), account);
        (gateway, sync, remote)
    }

    async fn authed(gateway: &MessageGateway, msg_type: &str, payload: Value) -> Response {
        let token = gateway.handle(&popup(), Request::new(GET_TOKEN)).await.data.unwrap()["token"]
            .as_str()
            .unwrap()
            .to_string();
        gateway
            .handle(
                &popup(),
                Request::new(msg_type).with_payload(payload).with_token(token),
            )
            .await
    }

    #[tokio::test]
    async fn save_then_list_records() {
        let (gateway, _, _) = host();

        let saved = authed(
            &gateway,
            "saveRecord",
            json!({"collection": "tasks", "id": "1", "record": {"title": "Buy milk", "lastModified": 1}}),
        )
        .await;
        assert!(saved.success, "{:?}", saved);
        assert_eq!(saved.data.as_ref().unwrap()["lastModified"], json!(1_000));

        let listed = gateway
            .handle(
                &popup(),
                Request::new("listRecords").with_payload(json!({"collection": "tasks"})),
            )
            .await;
        let records = listed.data.unwrap();
        assert_eq!(records.as_array().unwrap().len(), 1);
        assert_eq!(records[0]["title"], json!("Buy milk"));
    }

    #[tokio::test]
    async fn activity_log_ids_are_derived() {
        let (gateway, _, _) = host();
        let saved = authed(
            &gateway,
            "saveRecord",
            json!({"collection": "activityLogs", "record": {"timestamp": 5, "domain": "a.com", "seconds": 9}}),
        )
        .await;
        assert_eq!(saved.data.unwrap()["id"], json!("5:a.com"));
    }

    #[tokio::test]
    async fn deleted_records_leave_the_listing() {
        let (gateway, _, _) = host();
        authed(
            &gateway,
            "saveRecord",
            json!({"collection": "tasks", "id": "1", "record": {"title": "x"}}),
        )
        .await;

        let deleted = authed(&gateway, "deleteRecord", json!({"collection": "tasks", "id": "1"})).await;
        assert_eq!(deleted.data.unwrap()["deleted"], json!(true));

        let listed = gateway
            .handle(
                &popup(),
                Request::new("listRecords").with_payload(json!({"collection": "tasks"})),
            )
            .await;
        assert_eq!(listed.data.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn writes_require_a_token() {
        let (gateway, _, _) = host();
        let response = gateway
            .handle(
                &popup(),
                Request::new("saveRecord")
                    .with_payload(json!({"collection": "tasks", "id": "1", "record": {}})),
            )
            .await;
        assert_eq!(response.code, Some(ErrorCode::TokenMissing));
    }

    #[tokio::test]
    async fn invalid_payload_is_a_validation_error() {
        let (gateway, _, _) = host();
        let response = authed(&gateway, "saveRecord", json!({"collection": "cookies"})).await;
        assert_eq!(response.code, Some(ErrorCode::Validation));
    }

    #[tokio::test]
    async fn sync_requires_sign_in() {
        let (gateway, _, remote) = host();
        let response = authed(&gateway, "syncNow", Value::Null).await;
        assert_eq!(response.code, Some(ErrorCode::NotSignedIn));
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn signed_in_sync_reports_outcome() {
        let (gateway, sync, remote) = host();
        sync.set_auth_token(Some("account".to_string()));

        let response = authed(&gateway, "syncNow", Value::Null).await;
        assert!(response.success, "{:?}", response);
        assert_eq!(response.data.unwrap()["reason"], json!("userRequested"));
        assert_eq!(remote.pushes.load(Ordering::SeqCst), 5);

        let status = gateway.handle(&popup(), Request::new("getSyncStatus")).await;
        let data = status.data.unwrap();
        assert_eq!(data["signedIn"], json!(true));
        assert_eq!(data["status"]["phase"], json!("idle"));
        assert_eq!(data["status"]["lastSyncAt"], json!(1_000));
    }

    #[tokio::test]
    async fn sign_out_clears_account() {
        let (gateway, sync, _) = host();
        sync.set_auth_token(Some("account".to_string()));
        let response = authed(&gateway, "signOut", Value::Null).await;
        assert_eq!(response.data.unwrap(), json!({"signedIn": false}));
        assert!(!sync.is_signed_in());
    }

    #[tokio::test]
    async fn account_token_is_persisted_until_sign_out() {
        let backend = Arc::new(MemoryStore::new());
        let (gateway, sync, _) = host_with(backend.clone());

        let response = authed(&gateway, "signIn", json!({"token": "relay-token"})).await;
        assert_eq!(response.data.unwrap(), json!({"signedIn": true}));
        assert!(sync.is_signed_in());
        assert!(backend.snapshot().contains_key("account/token"));

        authed(&gateway, "signOut", Value::Null).await;
        assert!(!backend.snapshot().contains_key("account/token"));
    }

    #[tokio::test]
    async fn empty_sign_in_token_is_rejected() {
        let (gateway, sync, _) = host();
        let response = authed(&gateway, "signIn", json!({"token": "  "})).await;
        assert_eq!(response.code, Some(ErrorCode::Validation));
        assert!(!sync.is_signed_in());
    }

    #[tokio::test]
    async fn seal_and_open_export_payload() {
        let (gateway, _, _) = host();
        let export = json!({"cookies": [{"name": "sid", "value": "abc"}]});

        let sealed = authed(&gateway, "sealPayload", json!({"data": export})).await;
        let blob = sealed.data.unwrap();
        assert!(blob.get("ciphertext").is_some());

        let opened = authed(&gateway, "openPayload", json!({"blob": blob})).await;
        assert_eq!(opened.data.unwrap(), export);
    }
}
