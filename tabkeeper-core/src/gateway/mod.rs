//! Message gateway between extension contexts and the host.
//!
//! Every request is rate limited per origin before anything else. The
//! origin is supplied by whoever launched the host, never by the request.
//! Request types registered as [`Access::TokenRequired`] must carry a token
//! minted by the built-in `getToken` request for the same origin and sender
//! label; tokens are single use and expire after the configured TTL.

pub mod native_messaging;
pub mod protocol;
pub mod rate_limit;
pub mod tokens;

pub use protocol::{Envelope, ErrorCode, Request, Response, ResponseEnvelope};
pub use rate_limit::{FixedWindowLimiter, Limited};
pub use tokens::TokenStore;

use crate::clock::Clock;
use crate::config::GatewaySettings;
use crate::{AuthFailure, Result};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Built-in request type that mints a session token.
pub const GET_TOKEN: &str = "getToken";

/// Who may call a request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Open,
    TokenRequired,
}

/// Identity of the caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Trusted origin of the connection. Keys the rate limit.
    pub origin: String,
    /// Context label taken from the envelope. Only narrows token binding
    /// within `origin`.
    pub sender: String,
}

impl RequestContext {
    pub fn new(origin: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            sender: sender.into(),
        }
    }

    /// Key that session tokens are bound to.
    pub fn identity(&self) -> String {
        format!("{}#{}", self.origin, self.sender)
    }
}

type Handler =
    Arc<dyn Fn(RequestContext, Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct Route {
    access: Access,
    handler: Handler,
}

pub struct MessageGateway {
    routes: HashMap<String, Route>,
    tokens: TokenStore,
    limiter: FixedWindowLimiter,
    clock: Arc<dyn Clock>,
}

impl MessageGateway {
    pub fn new(settings: &GatewaySettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            routes: HashMap::new(),
            tokens: TokenStore::new(settings.token_ttl_ms),
            limiter: FixedWindowLimiter::new(settings.max_requests, settings.window_ms),
            clock,
        }
    }

    /// Register a handler for `msg_type`, replacing any earlier one.
    pub fn register<F, Fut>(
        &mut self,
        msg_type: impl Into<String>,
        access: Access,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let msg_type = msg_type.into();
        debug!(%msg_type, ?access, "Registered gateway handler");
        self.routes.insert(
            msg_type,
            Route {
                access,
                handler: Arc::new(move |ctx: RequestContext, payload: Option<Value>| {
                    handler(ctx, payload).boxed()
                }),
            },
        );
        self
    }

    pub fn access(&self, msg_type: &str) -> Option<Access> {
        if msg_type == GET_TOKEN {
            return Some(Access::Open);
        }
        self.routes.get(msg_type).map(|r| r.access)
    }

    /// Dispatch one request from `ctx`.
    pub async fn handle(&self, ctx: &RequestContext, request: Request) -> Response {
        let now = self.clock.now_ms();
        let sender = ctx.identity();

        if let Err(limited) = self.limiter.check(&ctx.origin, now) {
            warn!(origin = %ctx.origin, retry_after_ms = limited.retry_after_ms, "Rate limit exceeded");
            return Response::rate_limited(limited.retry_after_ms);
        }

        if request.msg_type == GET_TOKEN {
            let (token, expires_at) = self.tokens.mint(&sender, now);
            return Response::ok(json!({ "token": token, "expiresAt": expires_at }));
        }

        let Some(route) = self.routes.get(&request.msg_type) else {
            debug!(%sender, msg_type = %request.msg_type, "Unknown request type");
            return Response::error(
                ErrorCode::UnknownAction,
                format!("unknown request type: {}", request.msg_type),
            );
        };

        if route.access == Access::TokenRequired {
            let checked = match request.token.as_deref() {
                Some(token) => self.tokens.consume(&sender, token, now),
                None => Err(AuthFailure::TokenMissing),
            };
            if let Err(failure) = checked {
                warn!(%sender, msg_type = %request.msg_type, %failure, "Rejected request");
                return Response::from_error(&failure.into());
            }
        }

        match (route.handler)(ctx.clone(), request.payload).await {
            Ok(data) => Response::ok(data),
            Err(e) => {
                warn!(%sender, msg_type = %request.msg_type, error = %e, "Handler failed");
                Response::from_error(&e)
            }
        }
    }

    /// Dispatch a framed request arriving on a connection from `origin`,
    /// echoing its id.
    pub async fn handle_envelope(&self, origin: &str, envelope: Envelope) -> ResponseEnvelope {
        let ctx = RequestContext::new(origin, envelope.sender);
        let response = self.handle(&ctx, envelope.request).await;
        ResponseEnvelope {
            request_id: envelope.request_id,
            response,
        }
    }

    /// Purge expired tokens and elapsed rate windows.
    pub fn sweep_expired(&self) -> (usize, usize) {
        let now = self.clock.now_ms();
        (self.tokens.sweep(now), self.limiter.sweep(now))
    }

    /// Run [`Self::sweep_expired`] on a fixed period.
    pub fn spawn_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip first tick

            loop {
                interval.tick().await;
                let (tokens, windows) = self.sweep_expired();
                if tokens + windows > 0 {
                    info!(tokens, windows, "Swept expired gateway state");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::TabkeeperError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(max_requests: u32) -> GatewaySettings {
        GatewaySettings {
            token_ttl_ms: 300_000,
            max_requests,
            window_ms: 60_000,
            sweep_interval_ms: 60_000,
        }
    }

    fn gateway(max_requests: u32) -> (MessageGateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut gateway = MessageGateway::new(&settings(max_requests), clock.clone());
        gateway
            .register("ping", Access::Open, |_ctx, _payload| async {
                Ok(json!("pong"))
            })
            .register("syncNow", Access::TokenRequired, |ctx: RequestContext, _payload| async move {
                Ok(json!({ "by": ctx.sender }))
            })
            .register("fails", Access::Open, |_ctx, _payload| async {
                Err(TabkeeperError::Validation("bad payload".to_string()))
            });
        (gateway, clock)
    }

    const ORIGIN: &str = "chrome-extension://tabkeeper/";

    fn from(sender: &str) -> RequestContext {
        RequestContext::new(ORIGIN, sender)
    }

    async fn token_for(gateway: &MessageGateway, sender: &str) -> String {
        let response = gateway.handle(&from(sender), Request::new(GET_TOKEN)).await;
        assert!(response.success);
        response.data.unwrap()["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn open_requests_need_no_token() {
        let (gateway, _) = gateway(100);
        let response = gateway.handle(&from("popup"), Request::new("ping")).await;
        assert_eq!(response, Response::ok(json!("pong")));
    }

    #[tokio::test]
    async fn token_accepted_once_for_its_sender() {
        let (gateway, _) = gateway(100);
        let token = token_for(&gateway, "popup").await;

        let mismatch = gateway
            .handle(&from("content"), Request::new("syncNow").with_token(&token))
            .await;
        assert_eq!(mismatch.code, Some(ErrorCode::TokenSenderMismatch));

        let ok = gateway
            .handle(&from("popup"), Request::new("syncNow").with_token(&token))
            .await;
        assert_eq!(ok.data, Some(json!({ "by": "popup" })));

        let reused = gateway
            .handle(&from("popup"), Request::new("syncNow").with_token(&token))
            .await;
        assert_eq!(reused.code, Some(ErrorCode::TokenMissing));
    }

    #[tokio::test]
    async fn missing_and_expired_tokens_fail_closed() {
        let (gateway, clock) = gateway(100);

        let missing = gateway.handle(&from("popup"), Request::new("syncNow")).await;
        assert!(!missing.success);
        assert_eq!(missing.code, Some(ErrorCode::TokenMissing));

        let token = token_for(&gateway, "popup").await;
        clock.advance(300_000);
        let expired = gateway
            .handle(&from("popup"), Request::new("syncNow").with_token(&token))
            .await;
        assert_eq!(expired.code, Some(ErrorCode::TokenExpired));
    }

    #[tokio::test]
    async fn unknown_type_is_reported() {
        let (gateway, _) = gateway(100);
        let response = gateway.handle(&from("popup"), Request::new("launchMissiles")).await;
        assert_eq!(response.code, Some(ErrorCode::UnknownAction));
    }

    #[tokio::test]
    async fn handler_errors_map_to_codes() {
        let (gateway, _) = gateway(100);
        let response = gateway.handle(&from("popup"), Request::new("fails")).await;
        assert!(!response.success);
        assert_eq!(response.code, Some(ErrorCode::Validation));
    }

    #[tokio::test]
    async fn rate_limit_applies_before_dispatch() {
        let (gateway, clock) = gateway(3);

        for _ in 0..3 {
            assert!(gateway.handle(&from("popup"), Request::new("ping")).await.success);
        }
        let limited = gateway.handle(&from("popup"), Request::new("ping")).await;
        assert_eq!(limited.code, Some(ErrorCode::RateLimited));
        assert_eq!(limited.retry_after_ms, Some(60_000));

        // Unknown types and token requests count too.
        let limited = gateway.handle(&from("popup"), Request::new(GET_TOKEN)).await;
        assert_eq!(limited.code, Some(ErrorCode::RateLimited));

        let other = RequestContext::new("chrome-extension://other/", "popup");
        assert!(gateway.handle(&other, Request::new("ping")).await.success);

        clock.advance(60_000);
        assert!(gateway.handle(&from("popup"), Request::new("ping")).await.success);
    }

    #[tokio::test]
    async fn envelope_echoes_request_id() {
        let (gateway, _) = gateway(100);
        let response = gateway
            .handle_envelope(
                ORIGIN,
                Envelope {
                    sender: "popup".to_string(),
                    request_id: Some("42".to_string()),
                    request: Request::new("ping"),
                },
            )
            .await;
        assert_eq!(response.request_id.as_deref(), Some("42"));
        assert!(response.response.success);
    }

    #[tokio::test]
    async fn forged_sender_labels_share_the_origin_window() {
        let (gateway, _) = gateway(3);

        for i in 0..3 {
            let forged = Envelope {
                sender: format!("context-{}", i),
                request_id: None,
                request: Request::new("ping"),
            };
            assert!(gateway.handle_envelope(ORIGIN, forged).await.response.success);
        }

        let forged = Envelope {
            sender: "fresh".to_string(),
            request_id: None,
            request: Request::new("ping"),
        };
        let limited = gateway.handle_envelope(ORIGIN, forged).await.response;
        assert_eq!(limited.code, Some(ErrorCode::RateLimited));
    }

    #[tokio::test]
    async fn tokens_do_not_cross_origins() {
        let (gateway, _) = gateway(100);
        let token = token_for(&gateway, "popup").await;

        let elsewhere = RequestContext::new("chrome-extension://other/", "popup");
        let response = gateway
            .handle(&elsewhere, Request::new("syncNow").with_token(&token))
            .await;
        assert_eq!(response.code, Some(ErrorCode::TokenSenderMismatch));
    }

    #[tokio::test]
    async fn sweep_purges_expired_state() {
        let (gateway, clock) = gateway(100);
        token_for(&gateway, "popup").await;

        clock.advance(300_001);
        assert_eq!(gateway.sweep_expired(), (1, 1));
        assert_eq!(gateway.sweep_expired(), (0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_use_of_one_token_succeeds_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let clock = Arc::new(ManualClock::new(0));
        let mut gateway = MessageGateway::new(&settings(1_000), clock);
        let counter = calls.clone();
        gateway.register("syncNow", Access::TokenRequired, move |_ctx, _payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let gateway = Arc::new(gateway);
        let token = token_for(&gateway, "popup").await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let gateway = gateway.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    gateway
                        .handle(&from("popup"), Request::new("syncNow").with_token(token))
                        .await
                })
            })
            .collect();

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().success {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
