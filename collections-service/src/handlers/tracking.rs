//! Client-facing lifecycle endpoints reached from the emailed letter.
//!
//! None of these carry tenant headers: the letter link is the capability.
//! The notification id or invoice id in the path resolves the tenant from
//! the row itself.

use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{GatewayTransaction, MethodSelection};

/// 1x1 transparent GIF served by the open-tracking pixel.
const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Tracking pixel embedded in reminder letters.
///
/// Always serves the GIF, whether or not the notification exists, so the
/// endpoint cannot be used to probe for valid ids. Failures are logged and
/// swallowed for the same reason.
pub async fn open_pixel(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.lifecycle.record_open(notification_id).await {
        Ok(Some(record)) => {
            tracing::debug!(
                notification_id = %notification_id,
                open_count = record.open_count,
                "Notification open recorded"
            );
        }
        Ok(None) => {
            tracing::debug!(notification_id = %notification_id, "Open ping for unknown notification");
        }
        Err(e) => {
            tracing::warn!(notification_id = %notification_id, error = %e, "Failed to record open");
        }
    }

    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, max-age=0"),
        ],
        PIXEL_GIF,
    )
}

#[derive(Debug, Deserialize)]
pub struct SelectMethodRequest {
    pub method: String,
}

/// Discount summary returned to the payment page.
#[derive(Debug, Serialize)]
pub struct SelectMethodResponse {
    pub invoice_id: Uuid,
    pub selected_method: String,
    pub original_amount: Decimal,
    pub discount_percent: Decimal,
    pub amount_after_discount: Decimal,
    pub selected_utc: DateTime<Utc>,
}

impl From<MethodSelection> for SelectMethodResponse {
    fn from(s: MethodSelection) -> Self {
        Self {
            invoice_id: s.invoice_id,
            selected_method: s.selected_method,
            original_amount: s.original_amount,
            discount_percent: s.discount_percent,
            amount_after_discount: s.amount_after_discount,
            selected_utc: s.selected_utc,
        }
    }
}

/// Payment method selection from the emailed payment page.
pub async fn select_method(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<SelectMethodRequest>,
) -> Result<Json<SelectMethodResponse>, AppError> {
    tracing::info!(invoice_id = %invoice_id, method = %payload.method, "Method selection received");

    let selection = state
        .lifecycle
        .select_method(invoice_id, &payload.method)
        .await?;

    Ok(Json(SelectMethodResponse::from(selection)))
}

#[derive(Debug, Deserialize)]
pub struct PaymentStartedRequest {
    /// Processor transaction id the payment page just opened.
    pub transaction_id: String,
    /// Override for the amount being charged; defaults to the selection's
    /// discounted amount, falling back to the remaining balance.
    pub amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct PaymentStartedResponse {
    pub transaction_id: String,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
}

impl From<GatewayTransaction> for PaymentStartedResponse {
    fn from(t: GatewayTransaction) -> Self {
        Self {
            transaction_id: t.transaction_id,
            invoice_id: t.invoice_id,
            amount: t.amount,
            currency: t.currency,
            status: t.status,
        }
    }
}

/// Payment page boundary: pre-registers the processor transaction so the
/// completion webhook can correlate it back to the invoice. Idempotent
/// under page reloads.
pub async fn payment_started(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
    Json(payload): Json<PaymentStartedRequest>,
) -> Result<Json<PaymentStartedResponse>, AppError> {
    if payload.transaction_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "transaction_id must not be empty"
        )));
    }

    tracing::info!(
        invoice_id = %invoice_id,
        transaction_id = %payload.transaction_id,
        "Payment started"
    );

    let transaction = state
        .lifecycle
        .register_payment_started(invoice_id, &payload.transaction_id, payload.amount)
        .await?;

    Ok(Json(PaymentStartedResponse::from(transaction)))
}
