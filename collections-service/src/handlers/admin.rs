//! Operator endpoints: manual reminder runs, the run ledger, webhook
//! forensics and payment terminal provisioning.

use crate::middleware::TenantContext;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::{GatewayAccount, ReminderRun, RunType, WebhookAuditRecord};

/// Trigger a reminder run for the tenant outside the schedule. Runs to
/// completion before responding; the body is the run ledger row.
pub async fn run_reminders(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<ReminderRun>, AppError> {
    tracing::info!(tenant_id = %tenant.tenant_id, "Manual reminder run requested");

    let run = state
        .dispatcher
        .run_tenant(tenant.tenant_id, RunType::Manual, Utc::now())
        .await?;

    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListRunsResponse {
    pub runs: Vec<ReminderRun>,
    pub next_page_token: Option<Uuid>,
}

pub async fn list_runs(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListRunsResponse>, AppError> {
    let page_size = query.page_size.unwrap_or(50);
    let runs = state
        .db
        .list_runs(tenant.tenant_id, page_size, query.page_token)
        .await?;

    let next_page_token = if runs.len() as i64 == i64::from(page_size.clamp(1, 100)) {
        runs.last().map(|r| r.run_id)
    } else {
        None
    };

    Ok(Json(ListRunsResponse {
        runs,
        next_page_token,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListWebhookAuditQuery {
    /// Filter to one outcome (applied, duplicate, bad_signature, ...).
    pub outcome: Option<String>,
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ListWebhookAuditResponse {
    pub deliveries: Vec<WebhookAuditRecord>,
    pub next_page_token: Option<Uuid>,
}

/// Forensic listing of webhook deliveries, one row per delivery including
/// the rejected ones.
pub async fn list_webhook_audit(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListWebhookAuditQuery>,
) -> Result<Json<ListWebhookAuditResponse>, AppError> {
    let page_size = query.page_size.unwrap_or(50);
    let deliveries = state
        .db
        .list_webhook_audit(
            tenant.tenant_id,
            query.outcome.as_deref(),
            page_size,
            query.page_token,
        )
        .await?;

    let next_page_token = if deliveries.len() as i64 == i64::from(page_size.clamp(1, 100)) {
        deliveries.last().map(|d| d.audit_id)
    } else {
        None
    };

    Ok(Json(ListWebhookAuditResponse {
        deliveries,
        next_page_token,
    }))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateGatewayAccountRequest {
    #[validate(length(min = 1, max = 64))]
    pub terminal_id: String,
    /// Shared HMAC secret the processor signs webhook bodies with.
    #[validate(length(min = 16))]
    pub webhook_secret: String,
    #[validate(length(min = 3, max = 3))]
    pub currency: String,
}

/// Terminal provisioning response. The webhook secret is write-only.
#[derive(Debug, Serialize)]
pub struct GatewayAccountResponse {
    pub account_id: Uuid,
    pub tenant_id: Uuid,
    pub terminal_id: String,
    pub currency: String,
    pub created_utc: DateTime<Utc>,
}

impl From<GatewayAccount> for GatewayAccountResponse {
    fn from(a: GatewayAccount) -> Self {
        Self {
            account_id: a.account_id,
            tenant_id: a.tenant_id,
            terminal_id: a.terminal_id,
            currency: a.currency,
            created_utc: a.created_utc,
        }
    }
}

/// Register the processor terminal for this tenant so its webhook
/// deliveries can be attributed and signature-checked.
pub async fn create_gateway_account(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateGatewayAccountRequest>,
) -> Result<(StatusCode, Json<GatewayAccountResponse>), AppError> {
    payload.validate()?;

    let account = state
        .db
        .create_gateway_account(
            tenant.tenant_id,
            &payload.terminal_id,
            &payload.webhook_secret,
            &payload.currency,
        )
        .await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        terminal_id = %account.terminal_id,
        "Gateway terminal registered"
    );

    Ok((StatusCode::CREATED, Json(GatewayAccountResponse::from(account))))
}
