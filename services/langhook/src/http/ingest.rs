//! The ingest endpoint: `POST /ingest/{source}`.
//!
//! Accepts any JSON webhook, verifies an optional HMAC signature, and
//! enqueues a raw event. Nothing here blocks on downstream consumers; a 202
//! means "on the stream", not "processed".

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    Json,
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use lh_protocol::subject::MAP_FAIL_SUBJECT;
use lh_protocol::{MappingFailure, RawEvent, SignatureState};
use sha2::Sha256;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state::AppState;

use super::response;

type HmacSha256 = Hmac<Sha256>;

/// Headers checked for a hex HMAC-SHA256 signature, in order.
const SIGNATURE_HEADERS: &[&str] = &["x-hub-signature-256", "x-signature", "x-webhook-signature"];

pub async fn ingest_webhook(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4();

    if !state.limiter.try_acquire(&addr.ip().to_string()) {
        return response::too_many_requests("rate limit exceeded");
    }

    if body.len() > state.settings.max_body_bytes {
        warn!(
            source,
            request_id = %request_id,
            body_size = body.len(),
            limit = state.settings.max_body_bytes,
            "request body too large"
        );
        return response::payload_too_large("request body too large");
    }

    let header_map = flatten_headers(&headers);

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            // Malformed bodies still leave a trace on the dead-letter
            // subject before the 400.
            let failure = MappingFailure {
                id: request_id,
                timestamp: Utc::now(),
                source: source.clone(),
                error: format!("invalid JSON payload: {e}"),
                payload: serde_json::Value::String(String::from_utf8_lossy(&body).into_owned()),
            };
            if let Ok(bytes) = serde_json::to_vec(&failure) {
                let _ = state.bus.publish(MAP_FAIL_SUBJECT, bytes);
            }
            warn!(source, request_id = %request_id, error = %e, "invalid JSON payload");
            return response::bad_request("invalid JSON payload");
        }
    };

    let signature_valid = verify_signature(state.settings.secret_for(&source), &body, &header_map);
    if signature_valid == SignatureState::Invalid {
        warn!(source, request_id = %request_id, "invalid HMAC signature");
        return response::unauthorized("invalid signature");
    }

    let raw = RawEvent {
        id: request_id,
        timestamp: Utc::now(),
        source: source.clone(),
        signature_valid,
        headers: header_map,
        payload,
    };
    let bytes = match serde_json::to_vec(&raw) {
        Ok(bytes) => bytes,
        Err(e) => return response::internal_error(e),
    };
    match state.bus.publish(&state.settings.raw_subject, bytes) {
        Ok(()) => {}
        // Saturated or draining raw stream: tell the sender to retry
        // rather than pretend the event was accepted.
        Err(e @ crate::bus::BusError::ServiceUnavailable) => {
            warn!(source, request_id = %request_id, error = %e, "raw stream unavailable");
            return response::service_unavailable("event stream is not accepting messages");
        }
        Err(e) => return response::internal_error(e),
    }

    info!(
        source,
        request_id = %request_id,
        signature_valid = ?Option::<bool>::from(signature_valid),
        "event ingested"
    );
    (
        StatusCode::ACCEPTED,
        [("x-request-id", request_id.to_string())],
        Json(serde_json::json!({
            "message": "Event accepted",
            "request_id": request_id,
        })),
    )
        .into_response()
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_owned()))
        })
        .collect()
}

/// HMAC-SHA256 verification against a per-source secret.
///
/// No secret configured → `Unchecked`. With a secret, the signature must be
/// present in one of the known headers (either bare hex or the
/// `sha256=<hex>` GitHub form) and match the body digest.
pub fn verify_signature(
    secret: Option<&str>,
    body: &[u8],
    headers: &BTreeMap<String, String>,
) -> SignatureState {
    let Some(secret) = secret else {
        return SignatureState::Unchecked;
    };

    let presented = SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .map(|value| value.strip_prefix("sha256=").unwrap_or(value));
    let Some(presented) = presented else {
        return SignatureState::Invalid;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return SignatureState::Invalid,
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if constant_time_eq(expected.as_bytes(), presented.trim().as_bytes()) {
        SignatureState::Valid
    } else {
        SignatureState::Invalid
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
