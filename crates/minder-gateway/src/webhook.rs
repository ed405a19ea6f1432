//! Webhook ingress: `POST /webhooks/{source}`.
//!
//! Each configured source carries an HMAC-SHA256 secret; the request body
//! is verified in constant time against the `X-Hub-Signature-256` header
//! (`sha256=<hex>`), then payload fields are interpolated into the
//! source's message template and the result enters the coordinator as a
//! normal inbound message.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use minder_channels::{EnqueueOutcome, InboundHandler};
use minder_core::{InboundMessage, SettingsStore};

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookState {
    pub settings: Arc<SettingsStore>,
    pub handler: Arc<dyn InboundHandler>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{source}", post(webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn webhook(
    State(state): State<WebhookState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let settings = state.settings.snapshot();
    let Some(source_cfg) = settings
        .channels
        .webhooks
        .iter()
        .find(|s| s.name == source)
    else {
        warn!(source = %source, "unknown webhook source");
        return Err(reply(StatusCode::NOT_FOUND, "unknown webhook source"));
    };

    let Some(secret) = source_cfg.secret.as_ref().filter(|s| !s.is_empty()) else {
        warn!(source = %source, "webhook source has no secret configured");
        return Err(reply(StatusCode::UNAUTHORIZED, "source not accepting events"));
    };
    verify_signature(&headers, &body, secret.expose())
        .map_err(|e| reply(StatusCode::UNAUTHORIZED, e))?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| reply(StatusCode::BAD_REQUEST, "invalid JSON body"))?;

    let content = render_template(&source_cfg.template, &payload);
    info!(source = %source, bytes = body.len(), "webhook accepted");

    let inbound = InboundMessage {
        channel: "webhook".to_string(),
        chat_id: source.clone(),
        sender_id: source.clone(),
        sender_name: Some(source.clone()),
        content,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    match state.handler.enqueue(inbound) {
        EnqueueOutcome::Accepted => Ok(Json(json!({ "ok": true }))),
        EnqueueOutcome::Busy => Err(reply(StatusCode::SERVICE_UNAVAILABLE, "busy")),
    }
}

fn reply(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

/// GitHub-style signature check: `sha256=<hex>` over the raw body,
/// compared in constant time via `Mac::verify_slice`.
fn verify_signature(
    headers: &HeaderMap,
    body: &[u8],
    secret: &str,
) -> Result<(), &'static str> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing X-Hub-Signature-256 header")?;
    let hex_sig = header
        .strip_prefix("sha256=")
        .ok_or("malformed X-Hub-Signature-256 header")?;
    let expected = hex::decode(hex_sig).map_err(|_| "signature is not valid hex")?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key")?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| "signature mismatch")
}

/// Substitute `{field.path}` placeholders with values from the payload.
/// Dot paths descend into objects; missing paths render as empty. Non-string
/// leaves render as compact JSON.
fn render_template(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let path = &after[..end];
                out.push_str(&lookup(payload, path));
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(payload: &Value, path: &str) -> String {
    let mut current = payload;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature_for(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"event":"push"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            signature_for("s3cret", body).parse().unwrap(),
        );
        assert!(verify_signature(&headers, body, "s3cret").is_ok());
    }

    #[test]
    fn wrong_secret_fails() {
        let body = br#"{"event":"push"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            signature_for("wrong", body).parse().unwrap(),
        );
        assert_eq!(
            verify_signature(&headers, body, "s3cret"),
            Err("signature mismatch")
        );
    }

    #[test]
    fn missing_header_fails() {
        let headers = HeaderMap::new();
        assert!(verify_signature(&headers, b"{}", "s").is_err());
    }

    #[test]
    fn template_renders_dot_paths() {
        let payload = serde_json::json!({
            "action": "opened",
            "pull_request": { "title": "Fix the bug", "number": 42 }
        });
        let rendered = render_template(
            "PR {pull_request.number}: {pull_request.title} ({action})",
            &payload,
        );
        assert_eq!(rendered, "PR 42: Fix the bug (opened)");
    }

    #[test]
    fn missing_paths_render_empty() {
        let payload = serde_json::json!({ "a": 1 });
        assert_eq!(render_template("x{no.such.path}y", &payload), "xy");
    }

    #[test]
    fn unclosed_brace_is_literal() {
        let payload = serde_json::json!({});
        assert_eq!(render_template("brace { here", &payload), "brace { here");
    }
}
