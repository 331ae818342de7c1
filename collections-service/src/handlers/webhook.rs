//! Inbound payment processor webhook.
//!
//! The processor retries deliveries that do not come back quickly with the
//! fixed acknowledgement body, so this handler acknowledges everything,
//! malformed payloads and forged signatures included. What actually happened
//! lives in the webhook_audit table and the metrics, never in the response.

use crate::services::WEBHOOK_ACK;
use crate::startup::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode};

/// Header carrying the HMAC-SHA256 signature of the raw body.
pub const SIGNATURE_HEADER: &str = "X-Gateway-Signature";

pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state.reconciler.process(&body, signature).await;
    tracing::debug!(outcome = outcome.as_str(), "Webhook delivery acknowledged");

    (StatusCode::OK, WEBHOOK_ACK)
}
