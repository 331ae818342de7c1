//! Invoice registration and lifecycle surface (staff, tenant-scoped).

use crate::middleware::TenantContext;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CreateInvoice, Invoice, InvoiceStatus, ListInvoicesFilter, MethodSelection,
    NotificationRecord, ReminderDispatch,
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvoiceRequest {
    pub client_id: Uuid,
    #[validate(email)]
    pub client_email: String,
    pub total_amount: Decimal,
    #[validate(length(min = 3, max = 3))]
    pub currency: String,
}

/// Register a calculated fee record with the engine. Starts in `draft`;
/// reminders only consider it once the letter system reports it sent.
pub async fn create_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<Invoice>), AppError> {
    payload.validate()?;

    if payload.total_amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "total_amount must be positive"
        )));
    }

    let input = CreateInvoice {
        tenant_id: tenant.tenant_id,
        client_id: payload.client_id,
        client_email: payload.client_email,
        total_amount: payload.total_amount,
        currency: payload.currency,
    };

    let invoice = state.db.create_invoice(&input).await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        invoice_id = %invoice.invoice_id,
        total_amount = %invoice.total_amount,
        "Invoice registered"
    );

    Ok((StatusCode::CREATED, Json(invoice)))
}

#[derive(Debug, Serialize)]
pub struct RecordSentResponse {
    pub invoice_id: Uuid,
    pub status: String,
    pub sent_utc: Option<DateTime<Utc>>,
    /// Tracking pixel id the outbound letter must embed.
    pub notification_id: Uuid,
}

/// The letter system reports the invoice letter went out.
///
/// Returns the notification id the letter embeds as its tracking pixel.
/// Calling it again appends another notification row without resetting the
/// original sent timestamp.
pub async fn record_sent(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<RecordSentResponse>, AppError> {
    let (invoice, notification) = state
        .lifecycle
        .record_sent(tenant.tenant_id, invoice_id)
        .await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        invoice_id = %invoice_id,
        notification_id = %notification.notification_id,
        "Invoice send recorded"
    );

    Ok(Json(RecordSentResponse {
        invoice_id: invoice.invoice_id,
        status: invoice.status,
        sent_utc: invoice.sent_utc,
        notification_id: notification.notification_id,
    }))
}

#[derive(Debug, Serialize)]
pub struct InvoiceTimelineResponse {
    pub invoice: Invoice,
    pub selection: Option<MethodSelection>,
    pub notifications: Vec<NotificationRecord>,
    pub dispatches: Vec<ReminderDispatch>,
}

/// Full lifecycle view: the invoice plus its selection, letters and
/// reminder history.
pub async fn get_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceTimelineResponse>, AppError> {
    let invoice = state
        .db
        .get_invoice(tenant.tenant_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

    let selection = state
        .db
        .get_method_selection(tenant.tenant_id, invoice_id)
        .await?;
    let notifications = state
        .db
        .list_notifications(tenant.tenant_id, invoice_id)
        .await?;
    let dispatches = state.db.list_dispatches(tenant.tenant_id, invoice_id).await?;

    Ok(Json(InvoiceTimelineResponse {
        invoice,
        selection,
        notifications,
        dispatches,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListInvoicesQuery {
    pub status: Option<InvoiceStatus>,
    pub client_id: Option<Uuid>,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListInvoicesResponse {
    pub invoices: Vec<Invoice>,
    pub next_page_token: Option<Uuid>,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListInvoicesQuery>,
) -> Result<Json<ListInvoicesResponse>, AppError> {
    let filter = ListInvoicesFilter {
        status: query.status,
        client_id: query.client_id,
        page_size: query.page_size.unwrap_or(50),
        page_token: query.page_token,
    };

    let invoices = state.db.list_invoices(tenant.tenant_id, &filter).await?;

    let next_page_token = if invoices.len() as i64 == i64::from(filter.page_size.clamp(1, 100)) {
        invoices.last().map(|i| i.invoice_id)
    } else {
        None
    };

    Ok(Json(ListInvoicesResponse {
        invoices,
        next_page_token,
    }))
}
