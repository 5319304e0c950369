//! Push-webhook endpoint.
//!
//! Deliveries are acknowledged with 202 before any work starts; the push is
//! processed on a spawned task so slow generation never makes GitHub retry.

pub mod processor;
pub mod push;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, info, warn};

pub use processor::{PipelineProcessor, PushHandler, RepoLockGuard, RepoLocks};
pub use push::{ChangedPaths, PushEvent};

use crate::config::Config;
use crate::llm::client::LlmClient;
use crate::util::SecretString;

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const EVENT_HEADER: &str = "x-github-event";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    secret: Option<SecretString>,
    handler: Arc<dyn PushHandler>,
}

impl AppState {
    pub fn new(secret: Option<SecretString>, handler: Arc<dyn PushHandler>) -> Self {
        Self { secret, handler }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_delivery))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind `bind` and serve until the process is stopped.
pub async fn serve(config: Config, llm: Arc<dyn LlmClient>, bind: &str) -> Result<()> {
    let secret = config.webhook.secret()?;
    if secret.is_none() {
        warn!("No webhook secret configured; deliveries are not authenticated");
    }
    let handler: Arc<dyn PushHandler> = Arc::new(PipelineProcessor::new(config, llm));
    let app = router(AppState::new(secret, handler));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening for webhooks on {}", listener.local_addr()?);
    axum::serve(listener, app).await.context("Webhook server failed")
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn handle_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(secret) = &state.secret {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        let valid = signature.is_some_and(|sig| verify_signature(secret.expose().as_bytes(), &body, sig));
        if !valid {
            warn!("Rejected webhook delivery with a missing or invalid signature");
            return (StatusCode::UNAUTHORIZED, Json(json!({ "status": "Unauthorized" })));
        }
    }

    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event != "push" {
        debug!("Ignoring '{}' event", event);
        return (StatusCode::ACCEPTED, Json(json!({ "status": "Ignored" })));
    }

    let push: PushEvent = match serde_json::from_slice(&body) {
        Ok(push) => push,
        Err(e) => {
            warn!("Malformed push payload: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "Bad Request", "error": e.to_string() })),
            );
        }
    };

    info!(
        "Accepted push to {} ({} commit(s))",
        push.repository.full_name,
        push.commits.len()
    );
    let handler = state.handler.clone();
    tokio::spawn(async move {
        let repository = push.repository.full_name.clone();
        if let Err(e) = handler.handle(push).await {
            error!("Processing push to {} failed: {:#}", repository, e);
        }
    });

    (StatusCode::ACCEPTED, Json(json!({ "status": "Accepted" })))
}

/// Check an `X-Hub-Signature-256` value (`sha256=<hex>`) in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Signature header value for `payload`.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<PushEvent>);

    #[async_trait]
    impl PushHandler for Recorder {
        async fn handle(&self, event: PushEvent) -> Result<()> {
            let _ = self.0.send(event);
            Ok(())
        }
    }

    const PUSH: &str = r#"{"ref":"refs/heads/main","after":"abc","repository":{"name":"shop","full_name":"acme/shop"},"commits":[{"id":"abc","added":["a.py"],"removed":[],"modified":[]}]}"#;

    fn state(secret: Option<&str>) -> (AppState, mpsc::UnboundedReceiver<PushEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = AppState::new(secret.map(|s| SecretString::from(s.to_string())), Arc::new(Recorder(tx)));
        (state, rx)
    }

    fn headers(event: &str, signature: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, event.parse().unwrap());
        if let Some(sig) = signature {
            headers.insert(SIGNATURE_HEADER, sig.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_signature_round_trip() {
        let sig = sign(b"It's a Secret to Everybody", b"Hello, World!");
        // Published example from GitHub's webhook documentation.
        assert_eq!(
            sig,
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        assert!(verify_signature(b"It's a Secret to Everybody", b"Hello, World!", &sig));
        assert!(!verify_signature(b"other", b"Hello, World!", &sig));
        assert!(!verify_signature(b"It's a Secret to Everybody", b"Hello, World!", "sha1=abc"));
        assert!(!verify_signature(b"It's a Secret to Everybody", b"Hello, World!", "sha256=zz"));
    }

    #[tokio::test]
    async fn test_push_is_accepted_and_handed_off() {
        let (state, mut rx) = state(None);
        let (status, Json(body)) = handle_delivery(State(state), headers("push", None), Bytes::from(PUSH)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "Accepted");

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.repository.full_name, "acme/shop");
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let (state, mut rx) = state(None);
        let (status, Json(body)) = handle_delivery(State(state), headers("ping", None), Bytes::from("{}")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "Ignored");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let (state, mut rx) = state(Some("s3cret"));
        let forged = sign(b"wrong", PUSH.as_bytes());
        let (status, _) = handle_delivery(State(state), headers("push", Some(&forged)), Bytes::from(PUSH)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_signature_is_rejected_when_secret_set() {
        let (state, _rx) = state(Some("s3cret"));
        let (status, _) = handle_delivery(State(state), headers("push", None), Bytes::from(PUSH)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_signed_push_is_accepted() {
        let (state, mut rx) = state(Some("s3cret"));
        let sig = sign(b"s3cret", PUSH.as_bytes());
        let (status, _) = handle_delivery(State(state), headers("push", Some(&sig)), Bytes::from(PUSH)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_malformed_push_payload() {
        let (state, _rx) = state(None);
        let (status, Json(body)) = handle_delivery(State(state), headers("push", None), Bytes::from("{\"ref\": 1}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "Bad Request");
    }
}
