//! Reminder rule administration (staff, tenant-scoped).

use crate::middleware::TenantContext;
use crate::services::{default_rules, CompiledTrigger};
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{CreateRule, ReminderRule, UpdateRule};

/// List every rule for the tenant, active and disabled, by priority.
pub async fn list_rules(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<Vec<ReminderRule>>, AppError> {
    let rules = state.db.list_rules(tenant.tenant_id).await?;
    Ok(Json(rules))
}

/// Create a rule. Trigger conditions are compiled up front so a rule that
/// could never match (missing day window, empty status set, duplicates) is
/// rejected here instead of silently matching nothing at run time.
pub async fn create_rule(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateRule>,
) -> Result<(StatusCode, Json<ReminderRule>), AppError> {
    CompiledTrigger::compile(&payload.trigger_conditions)?;

    let rule = state.db.create_rule(tenant.tenant_id, &payload).await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        rule_id = %rule.rule_id,
        reminder_type = %rule.reminder_type,
        "Reminder rule created"
    );

    Ok((StatusCode::CREATED, Json(rule)))
}

/// Partial update; absent fields keep their current value. New trigger
/// conditions go through the same compile gate as creation.
pub async fn update_rule(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(rule_id): Path<Uuid>,
    Json(payload): Json<UpdateRule>,
) -> Result<Json<ReminderRule>, AppError> {
    if let Some(conditions) = &payload.trigger_conditions {
        CompiledTrigger::compile(conditions)?;
    }

    let rule = state
        .db
        .update_rule(tenant.tenant_id, rule_id, &payload)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Rule {} not found", rule_id)))?;

    Ok(Json(rule))
}

/// Soft-disable: the rule stops matching but its dispatch history stays.
pub async fn disable_rule(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(rule_id): Path<Uuid>,
) -> Result<Json<ReminderRule>, AppError> {
    let rule = state
        .db
        .set_rule_active(tenant.tenant_id, rule_id, false)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Rule {} not found", rule_id)))?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        rule_id = %rule_id,
        "Reminder rule disabled"
    );

    Ok(Json(rule))
}

#[derive(Debug, Serialize)]
pub struct SeedDefaultsResponse {
    pub seeded: Vec<ReminderRule>,
    pub skipped: Vec<String>,
}

/// Tenant provisioning hook: install the default reminder ladder.
///
/// Idempotent per reminder_type: a tenant that already has any rule of a
/// given type keeps it, default or customized.
pub async fn seed_default_rules(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<SeedDefaultsResponse>, AppError> {
    let existing = state.db.list_rules(tenant.tenant_id).await?;
    let existing_types: Vec<&str> = existing.iter().map(|r| r.reminder_type.as_str()).collect();

    let mut seeded = Vec::new();
    let mut skipped = Vec::new();

    for default in default_rules() {
        if existing_types.contains(&default.reminder_type.as_str()) {
            skipped.push(default.reminder_type);
            continue;
        }
        let rule = state.db.create_rule(tenant.tenant_id, &default).await?;
        seeded.push(rule);
    }

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        seeded = seeded.len(),
        skipped = skipped.len(),
        "Default reminder rules seeded"
    );

    Ok(Json(SeedDefaultsResponse { seeded, skipped }))
}
