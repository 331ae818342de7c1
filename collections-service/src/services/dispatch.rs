//! Dispatch coordinator: turns rule matches into at-most-once reminder
//! sends. The enforcement point is the claim row in the database; the send
//! itself happens outside the claim transaction so a slow letter API never
//! holds row locks.

use crate::models::{Invoice, ReminderRule, RuleAction, ReminderRun, RunStatus, RunType};
use crate::services::metrics::{
    record_reminder_dispatched, record_reminder_run, record_send_failure,
};
use crate::services::rules::{CompiledTrigger, RuleEngine};
use crate::services::sender::{LetterRequest, LetterSender};
use crate::services::Database;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// What happened to one candidate invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Letter sent and the dispatch confirmed.
    Sent,
    /// Log-only rule: dispatch recorded without a send.
    Logged,
    /// Claim lost or the invoice stopped qualifying; nothing recorded.
    Skipped,
    /// Send failed; the claim was released for a later tick.
    Failed,
}

/// Aggregate counts for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub tenants_processed: u32,
    pub tenants_failed: u32,
    pub rules_evaluated: i32,
    pub invoices_matched: i32,
    pub dispatches_sent: i32,
    pub send_failures: i32,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunCounts {
    rules_evaluated: i32,
    invoices_matched: i32,
    dispatches_sent: i32,
    send_failures: i32,
}

pub struct Dispatcher {
    db: Arc<Database>,
    engine: RuleEngine,
    sender: Arc<dyn LetterSender>,
    stale_claim_horizon: Duration,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Database>,
        engine: RuleEngine,
        sender: Arc<dyn LetterSender>,
        stale_claim_minutes: i64,
    ) -> Self {
        Self {
            db,
            engine,
            sender,
            stale_claim_horizon: Duration::minutes(stale_claim_minutes),
        }
    }

    /// One scheduler tick: every tenant with active rules gets a run. A
    /// tenant failing never stops the others.
    #[instrument(skip(self))]
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();

        let tenants = match self.db.list_rule_tenants().await {
            Ok(tenants) => tenants,
            Err(e) => {
                error!(error = %e, "Failed to list tenants for reminder tick");
                return summary;
            }
        };

        for tenant_id in tenants {
            match self.run_tenant(tenant_id, RunType::Scheduled, now).await {
                Ok(run) => {
                    summary.rules_evaluated += run.rules_evaluated;
                    summary.invoices_matched += run.invoices_matched;
                    summary.dispatches_sent += run.dispatches_sent;
                    summary.send_failures += run.send_failures;
                    if RunStatus::from_string(&run.status) == RunStatus::Failed {
                        summary.tenants_failed += 1;
                    } else {
                        summary.tenants_processed += 1;
                    }
                }
                Err(e) => {
                    error!(tenant_id = %tenant_id, error = %e, "Tenant reminder run failed");
                    summary.tenants_failed += 1;
                }
            }
        }

        info!(
            tenants_processed = summary.tenants_processed,
            tenants_failed = summary.tenants_failed,
            dispatches_sent = summary.dispatches_sent,
            send_failures = summary.send_failures,
            "Reminder tick completed"
        );

        summary
    }

    /// Evaluate and dispatch every active rule for one tenant, under a run
    /// ledger row.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, run_type = %run_type.as_str()))]
    pub async fn run_tenant(
        &self,
        tenant_id: Uuid,
        run_type: RunType,
        now: DateTime<Utc>,
    ) -> Result<ReminderRun, AppError> {
        let run = self.db.create_run(tenant_id, run_type).await?;

        // Claims orphaned by a crashed batch would otherwise block their
        // invoices forever
        match self
            .db
            .reap_stale_claims(tenant_id, now - self.stale_claim_horizon)
            .await
        {
            Ok(_) => {}
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Failed to reap stale claims");
            }
        }

        let (counts, failure) = self.evaluate_rules(tenant_id, now).await;

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let run = self
            .db
            .complete_run(
                tenant_id,
                run.run_id,
                status,
                counts.rules_evaluated,
                counts.invoices_matched,
                counts.dispatches_sent,
                counts.send_failures,
                failure.as_deref(),
            )
            .await?;

        record_reminder_run(&tenant_id.to_string(), run_type.as_str(), status.as_str());

        Ok(run)
    }

    /// Walk the tenant's active rules in priority order. Send failures are
    /// isolated per invoice; a database error aborts the run with the counts
    /// collected so far.
    async fn evaluate_rules(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
    ) -> (RunCounts, Option<String>) {
        let mut counts = RunCounts::default();

        let rules = match self.db.list_active_rules(tenant_id).await {
            Ok(rules) => rules,
            Err(e) => return (counts, Some(e.to_string())),
        };

        for rule in rules {
            counts.rules_evaluated += 1;

            // Fail-closed: an uncompilable rule matches nothing
            let Some((trigger, action)) = self.engine.compile_rule(&rule) else {
                continue;
            };

            let candidates = match self
                .engine
                .select_candidates(tenant_id, &rule, &trigger, now)
                .await
            {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!(rule_id = %rule.rule_id, error = %e, "Candidate selection failed");
                    return (counts, Some(e.to_string()));
                }
            };
            counts.invoices_matched += candidates.len() as i32;

            for invoice in candidates {
                match self
                    .dispatch_one(&rule, &trigger, &action, &invoice, now)
                    .await
                {
                    Ok(DispatchOutcome::Sent) | Ok(DispatchOutcome::Logged) => {
                        counts.dispatches_sent += 1;
                    }
                    Ok(DispatchOutcome::Skipped) => {}
                    Ok(DispatchOutcome::Failed) => {
                        counts.send_failures += 1;
                    }
                    Err(e) => {
                        error!(
                            invoice_id = %invoice.invoice_id,
                            rule_id = %rule.rule_id,
                            error = %e,
                            "Dispatch aborted the run"
                        );
                        return (counts, Some(e.to_string()));
                    }
                }
            }
        }

        (counts, None)
    }

    /// Claim, send, confirm. The claim is taken inside a transaction that
    /// re-checks status and cooldown under the invoice row lock; the letter
    /// goes out only once the claim is ours, and a failed send releases it.
    #[instrument(skip(self, rule, trigger, action, invoice), fields(invoice_id = %invoice.invoice_id, rule_id = %rule.rule_id))]
    async fn dispatch_one(
        &self,
        rule: &ReminderRule,
        trigger: &CompiledTrigger,
        action: &RuleAction,
        invoice: &Invoice,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, AppError> {
        let cooldown_cutoff = self.engine.cooldown_cutoff(rule, now);
        let with_notification = matches!(action, RuleAction::Email { .. });

        let claim = self
            .db
            .claim_dispatch(
                invoice.tenant_id,
                invoice.invoice_id,
                rule.rule_id,
                &rule.reminder_type,
                action.channel(),
                &trigger.statuses,
                cooldown_cutoff,
                with_notification,
            )
            .await?;

        let Some((dispatch, notification, invoice)) = claim else {
            return Ok(DispatchOutcome::Skipped);
        };

        match action {
            RuleAction::Email { template } => {
                let letter = LetterRequest {
                    tenant_id: invoice.tenant_id,
                    invoice_id: invoice.invoice_id,
                    notification_id: notification.as_ref().map(|n| n.notification_id),
                    recipient: invoice.client_email.clone(),
                    template: template.clone(),
                    amount_due: invoice.amount_due(),
                    currency: invoice.currency.clone(),
                };

                match self.sender.send(&letter).await {
                    Ok(_) => {
                        self.db
                            .finalize_dispatch_sent(
                                invoice.tenant_id,
                                dispatch.dispatch_id,
                                invoice.invoice_id,
                            )
                            .await?;
                        record_reminder_dispatched(
                            &invoice.tenant_id.to_string(),
                            &rule.reminder_type,
                        );
                        Ok(DispatchOutcome::Sent)
                    }
                    Err(e) => {
                        warn!(
                            invoice_id = %invoice.invoice_id,
                            error = %e,
                            "Letter send failed, releasing claim"
                        );
                        self.db
                            .release_dispatch(
                                invoice.tenant_id,
                                dispatch.dispatch_id,
                                dispatch.notification_id,
                            )
                            .await?;
                        record_send_failure(&invoice.tenant_id.to_string(), &rule.reminder_type);
                        Ok(DispatchOutcome::Failed)
                    }
                }
            }
            RuleAction::LogOnly => {
                self.db
                    .finalize_dispatch_sent(
                        invoice.tenant_id,
                        dispatch.dispatch_id,
                        invoice.invoice_id,
                    )
                    .await?;
                record_reminder_dispatched(&invoice.tenant_id.to_string(), &rule.reminder_type);
                info!(
                    invoice_id = %invoice.invoice_id,
                    reminder_type = %rule.reminder_type,
                    "Log-only dispatch recorded"
                );
                Ok(DispatchOutcome::Logged)
            }
        }
    }
}
