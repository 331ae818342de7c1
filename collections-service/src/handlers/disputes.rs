//! Dispute submission and resolution.
//!
//! Submission is client-facing (reached from the letter's payment page, no
//! tenant headers); resolution and listing are staff endpoints.

use crate::middleware::TenantContext;
use crate::services::{record_dispute_operation, record_payment_amount, LetterRequest, PaymentSource};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Dispute, DisputeStatus, ResolveDispute, SubmitDispute};

/// Template identifier for the operator alert letter.
const DISPUTE_ALERT_TEMPLATE: &str = "dispute_alert";

/// Client claims an invoice the system considers unpaid was in fact paid.
///
/// The invoice id in the payload is the capability: the tenant comes from
/// the invoice row. Staff get an alert letter; a send failure is logged and
/// never blocks the submission.
pub async fn submit_dispute(
    State(state): State<AppState>,
    Json(payload): Json<SubmitDispute>,
) -> Result<(StatusCode, Json<Dispute>), AppError> {
    payload.validate()?;

    let invoice = state
        .db
        .get_invoice_unscoped(payload.invoice_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Invoice {} not found", payload.invoice_id))
        })?;

    let dispute = state.db.create_dispute(invoice.tenant_id, &payload).await?;

    tracing::info!(
        tenant_id = %invoice.tenant_id,
        invoice_id = %invoice.invoice_id,
        dispute_id = %dispute.dispute_id,
        "Dispute submitted"
    );
    record_dispute_operation(&invoice.tenant_id.to_string(), "submitted");

    if let Some(recipient) = state.config.letter.staff_alert_email.clone() {
        let alert = LetterRequest {
            tenant_id: invoice.tenant_id,
            invoice_id: invoice.invoice_id,
            notification_id: None,
            recipient,
            template: DISPUTE_ALERT_TEMPLATE.to_string(),
            amount_due: invoice.amount_due(),
            currency: invoice.currency.clone(),
        };
        if let Err(e) = state.sender.send(&alert).await {
            tracing::warn!(
                dispute_id = %dispute.dispute_id,
                error = %e,
                "Failed to send dispute alert to staff"
            );
        }
    }

    Ok((StatusCode::CREATED, Json(dispute)))
}

#[derive(Debug, Serialize)]
pub struct ResolveDisputeResponse {
    pub dispute: Dispute,
    /// Invoice status after resolution; changes only for `resolved_paid`.
    pub invoice_status: String,
    pub invoice_amount_paid: Decimal,
}

/// Staff verdict on a pending dispute.
pub async fn resolve_dispute(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(dispute_id): Path<Uuid>,
    Json(payload): Json<ResolveDispute>,
) -> Result<Json<ResolveDisputeResponse>, AppError> {
    payload.validate()?;

    let resolved_by = tenant.user_id.as_deref().unwrap_or("staff");
    let (dispute, invoice, applied) = state
        .db
        .resolve_dispute(
            tenant.tenant_id,
            dispute_id,
            payload.resolution,
            payload.notes.as_deref(),
            resolved_by,
        )
        .await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        dispute_id = %dispute_id,
        resolution = %dispute.status,
        invoice_status = %invoice.status,
        "Dispute resolved"
    );
    record_dispute_operation(&tenant.tenant_id.to_string(), &dispute.status);
    if applied > Decimal::ZERO {
        record_payment_amount(
            &tenant.tenant_id.to_string(),
            &invoice.currency,
            PaymentSource::Dispute.as_str(),
            applied.to_f64().unwrap_or(0.0),
        );
    }

    Ok(Json(ResolveDisputeResponse {
        dispute,
        invoice_status: invoice.status,
        invoice_amount_paid: invoice.amount_paid,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListDisputesQuery {
    pub status: Option<DisputeStatus>,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListDisputesResponse {
    pub disputes: Vec<Dispute>,
    pub next_page_token: Option<Uuid>,
}

/// Staff listing, newest-first within the cursor ordering.
pub async fn list_disputes(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListDisputesQuery>,
) -> Result<Json<ListDisputesResponse>, AppError> {
    let page_size = query.page_size.unwrap_or(50);
    let status = query.status.map(|s| s.as_str());

    let disputes = state
        .db
        .list_disputes(tenant.tenant_id, status, page_size, query.page_token)
        .await?;

    let next_page_token = if disputes.len() as i64 == i64::from(page_size.clamp(1, 100)) {
        disputes.last().map(|d| d.dispute_id)
    } else {
        None
    };

    Ok(Json(ListDisputesResponse {
        disputes,
        next_page_token,
    }))
}
