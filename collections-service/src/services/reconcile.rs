//! Reconciliation gateway: webhook intake from the external payment
//! processor. Every delivery is audited, verified, and applied exactly once;
//! the processor always gets the same fixed acknowledgement back.

use crate::models::{SettlementResult, WebhookOutcome, WebhookPayload};
use crate::services::metrics::record_webhook_delivery;
use crate::services::{Database, LifecycleService};
use service_core::utils::signature::verify_payload;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Fixed acknowledgement body the processor expects on every delivery,
/// success or not. Internal outcomes never leak into the response.
pub const WEBHOOK_ACK: &str = "OK";

pub struct Reconciler {
    db: Arc<Database>,
    lifecycle: LifecycleService,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, lifecycle: LifecycleService) -> Self {
        Self { db, lifecycle }
    }

    /// Process one webhook delivery. The raw body is appended to the audit
    /// trail before anything is parsed or verified, so even garbage
    /// deliveries are forensically recoverable. Never returns an error: the
    /// outcome is recorded and the caller acks regardless.
    #[instrument(skip(self, raw_body, signature), fields(body_len = raw_body.len()))]
    pub async fn process(&self, raw_body: &[u8], signature: Option<&str>) -> WebhookOutcome {
        let raw_text = String::from_utf8_lossy(raw_body);

        let audit_id = match self.db.insert_webhook_audit(&raw_text).await {
            Ok(audit_id) => audit_id,
            Err(e) => {
                error!(error = %e, "Failed to append webhook audit row");
                record_webhook_delivery(WebhookOutcome::Error.as_str());
                return WebhookOutcome::Error;
            }
        };

        let payload: WebhookPayload = match serde_urlencoded::from_bytes(raw_body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(audit_id = %audit_id, error = %e, "Webhook payload failed to parse");
                return self
                    .finish(audit_id, WebhookOutcome::Malformed, None, None, None)
                    .await;
            }
        };

        let account = match self
            .db
            .get_gateway_account_by_terminal(&payload.terminal_id)
            .await
        {
            Ok(Some(account)) => account,
            Ok(None) => {
                warn!(terminal_id = %payload.terminal_id, "Webhook from unknown terminal");
                return self
                    .finish(audit_id, WebhookOutcome::UnknownTerminal, Some(&payload), None, None)
                    .await;
            }
            Err(e) => {
                error!(error = %e, "Failed to resolve webhook terminal");
                return self
                    .finish(audit_id, WebhookOutcome::Error, Some(&payload), None, None)
                    .await;
            }
        };

        let tenant_id = account.tenant_id;

        let signature_valid = match signature {
            Some(signature) => {
                verify_payload(&account.webhook_secret, raw_body, signature).unwrap_or(false)
            }
            None => false,
        };
        if !signature_valid {
            warn!(
                terminal_id = %payload.terminal_id,
                tenant_id = %tenant_id,
                "Webhook signature rejected"
            );
            return self
                .finish(
                    audit_id,
                    WebhookOutcome::BadSignature,
                    Some(&payload),
                    Some(tenant_id),
                    Some(false),
                )
                .await;
        }

        let outcome = if payload.is_success() {
            self.apply_success(tenant_id, &payload).await
        } else {
            self.apply_failure(tenant_id, &payload).await
        };

        self.finish(audit_id, outcome, Some(&payload), Some(tenant_id), Some(true))
            .await
    }

    async fn apply_success(&self, tenant_id: Uuid, payload: &WebhookPayload) -> WebhookOutcome {
        match self
            .lifecycle
            .mark_completed(tenant_id, &payload.transaction_id, &payload.response_code)
            .await
        {
            Ok(SettlementResult::Applied { .. }) => WebhookOutcome::Applied,
            Ok(SettlementResult::AlreadyCompleted(_)) => {
                info!(
                    transaction_id = %payload.transaction_id,
                    tenant_id = %tenant_id,
                    "Duplicate delivery for settled transaction"
                );
                WebhookOutcome::Duplicate
            }
            Ok(SettlementResult::NotRegistered) => {
                warn!(
                    transaction_id = %payload.transaction_id,
                    tenant_id = %tenant_id,
                    "Success notification for unregistered transaction"
                );
                WebhookOutcome::UnknownTransaction
            }
            Err(e) => {
                error!(
                    error = %e,
                    transaction_id = %payload.transaction_id,
                    "Failed to apply completion"
                );
                WebhookOutcome::Error
            }
        }
    }

    async fn apply_failure(&self, tenant_id: Uuid, payload: &WebhookPayload) -> WebhookOutcome {
        match self
            .db
            .record_gateway_failure(tenant_id, &payload.transaction_id, &payload.response_code)
            .await
        {
            Ok(Some(_)) => {
                info!(
                    transaction_id = %payload.transaction_id,
                    response_code = %payload.response_code,
                    "Processor failure recorded"
                );
                WebhookOutcome::FailureLogged
            }
            Ok(None) => {
                // Either never registered, or already completed and protected
                // from downgrade
                match self
                    .db
                    .get_gateway_transaction(tenant_id, &payload.transaction_id)
                    .await
                {
                    Ok(Some(_)) => {
                        warn!(
                            transaction_id = %payload.transaction_id,
                            "Failure notification for settled transaction, not downgraded"
                        );
                        WebhookOutcome::FailureLogged
                    }
                    Ok(None) => {
                        warn!(
                            transaction_id = %payload.transaction_id,
                            "Failure notification for unregistered transaction"
                        );
                        WebhookOutcome::UnknownTransaction
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to look up transaction");
                        WebhookOutcome::Error
                    }
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    transaction_id = %payload.transaction_id,
                    "Failed to record processor failure"
                );
                WebhookOutcome::Error
            }
        }
    }

    /// Finalize the audit row and count the delivery. Audit finalization is
    /// best effort; the outcome already stands.
    async fn finish(
        &self,
        audit_id: Uuid,
        outcome: WebhookOutcome,
        payload: Option<&WebhookPayload>,
        tenant_id: Option<Uuid>,
        signature_valid: Option<bool>,
    ) -> WebhookOutcome {
        let amount = payload.map(|p| p.amount.to_string());

        if let Err(e) = self
            .db
            .finalize_webhook_audit(
                audit_id,
                outcome,
                tenant_id,
                payload.map(|p| p.terminal_id.as_str()),
                payload.map(|p| p.transaction_id.as_str()),
                payload.map(|p| p.response_code.as_str()),
                amount.as_deref(),
                signature_valid,
            )
            .await
        {
            warn!(audit_id = %audit_id, error = %e, "Failed to finalize webhook audit");
        }

        record_webhook_delivery(outcome.as_str());
        outcome
    }
}
