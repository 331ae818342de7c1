//! Rule engine: compiles stored trigger predicates and selects the invoices
//! they currently match.

use crate::models::{CreateRule, Invoice, ReminderRule, RuleAction, TriggerCondition};
use crate::services::metrics::record_rule_compile_failure;
use crate::services::Database;
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{instrument, warn};

/// Why a stored trigger predicate could not be compiled.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("trigger conditions are not valid JSON: {0}")]
    MalformedConditions(#[from] serde_json::Error),
    #[error("duplicate {0} condition")]
    DuplicateCondition(&'static str),
    #[error("missing required {0} condition")]
    MissingCondition(&'static str),
    #[error("days_since_sent must be non-negative, got {0}")]
    NegativeDays(i64),
    #[error("status_in must list at least one status")]
    EmptyStatusSet,
}

impl From<RuleError> for AppError {
    fn from(e: RuleError) -> Self {
        AppError::BadRequest(anyhow::anyhow!("{}", e))
    }
}

/// A trigger predicate lowered to the parameters of the candidate query.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTrigger {
    pub days_since_sent: i64,
    pub statuses: Vec<String>,
    pub opened: Option<bool>,
    pub require_no_selection: bool,
}

impl CompiledTrigger {
    /// Compile a condition list into query parameters. Exactly one
    /// `days_since_sent` and one non-empty `status_in` are required;
    /// duplicates are rejected rather than letting one silently win.
    pub fn compile(conditions: &[TriggerCondition]) -> Result<Self, RuleError> {
        let mut days_since_sent: Option<i64> = None;
        let mut statuses: Option<Vec<String>> = None;
        let mut opened: Option<bool> = None;
        let mut require_no_selection = false;

        for condition in conditions {
            match condition {
                TriggerCondition::DaysSinceSent { days } => {
                    if *days < 0 {
                        return Err(RuleError::NegativeDays(*days));
                    }
                    if days_since_sent.replace(*days).is_some() {
                        return Err(RuleError::DuplicateCondition("days_since_sent"));
                    }
                }
                TriggerCondition::StatusIn { statuses: set } => {
                    if set.is_empty() {
                        return Err(RuleError::EmptyStatusSet);
                    }
                    let lowered = set.iter().map(|s| s.as_str().to_string()).collect();
                    if statuses.replace(lowered).is_some() {
                        return Err(RuleError::DuplicateCondition("status_in"));
                    }
                }
                TriggerCondition::Opened { value } => {
                    if opened.replace(*value).is_some() {
                        return Err(RuleError::DuplicateCondition("opened"));
                    }
                }
                TriggerCondition::NoMethodSelected => {
                    require_no_selection = true;
                }
            }
        }

        Ok(CompiledTrigger {
            days_since_sent: days_since_sent
                .ok_or(RuleError::MissingCondition("days_since_sent"))?,
            statuses: statuses.ok_or(RuleError::MissingCondition("status_in"))?,
            opened,
            require_no_selection,
        })
    }

    /// Parse and compile the JSONB predicate of a stored rule.
    pub fn from_rule(rule: &ReminderRule) -> Result<Self, RuleError> {
        let conditions: Vec<TriggerCondition> =
            serde_json::from_value(rule.trigger_conditions.clone())?;
        Self::compile(&conditions)
    }
}

/// Evaluates rules against invoice state. Selection is read-only and
/// idempotent; the dispatch claim is what consumes a match.
pub struct RuleEngine {
    db: Arc<Database>,
    default_cooldown_days: i64,
    batch_limit: i64,
}

impl RuleEngine {
    pub fn new(db: Arc<Database>, default_cooldown_days: i64, batch_limit: i64) -> Self {
        Self {
            db,
            default_cooldown_days,
            batch_limit,
        }
    }

    /// Parse a rule's predicate and action. Fail-closed: any parse or
    /// compile failure means the rule matches nothing; the failure is
    /// counted and logged, never propagated into the batch.
    pub fn compile_rule(&self, rule: &ReminderRule) -> Option<(CompiledTrigger, RuleAction)> {
        let trigger = match CompiledTrigger::from_rule(rule) {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!(
                    rule_id = %rule.rule_id,
                    tenant_id = %rule.tenant_id,
                    error = %e,
                    "Rule predicate failed to compile, matching nothing"
                );
                record_rule_compile_failure(&rule.tenant_id.to_string());
                return None;
            }
        };
        let action: RuleAction = match serde_json::from_value(rule.action.clone()) {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    rule_id = %rule.rule_id,
                    tenant_id = %rule.tenant_id,
                    error = %e,
                    "Rule action failed to parse, matching nothing"
                );
                record_rule_compile_failure(&rule.tenant_id.to_string());
                return None;
            }
        };
        Some((trigger, action))
    }

    /// Cooldown cutoff for a rule at `now`: per-rule override when set,
    /// otherwise the configured global default.
    pub fn cooldown_cutoff(&self, rule: &ReminderRule, now: DateTime<Utc>) -> DateTime<Utc> {
        let days = rule
            .cooldown_days
            .map(i64::from)
            .unwrap_or(self.default_cooldown_days);
        now - Duration::days(days)
    }

    /// Invoices the rule's trigger currently holds for, minus those inside
    /// the rule's cooldown window or with an in-flight claim.
    #[instrument(skip(self, rule, trigger), fields(tenant_id = %tenant_id, rule_id = %rule.rule_id))]
    pub async fn select_candidates(
        &self,
        tenant_id: uuid::Uuid,
        rule: &ReminderRule,
        trigger: &CompiledTrigger,
        now: DateTime<Utc>,
    ) -> Result<Vec<Invoice>, AppError> {
        let sent_cutoff = now - Duration::days(trigger.days_since_sent);
        let cooldown_cutoff = self.cooldown_cutoff(rule, now);

        self.db
            .select_reminder_candidates(
                tenant_id,
                &trigger.statuses,
                sent_cutoff,
                trigger.opened,
                trigger.require_no_selection,
                &rule.reminder_type,
                cooldown_cutoff,
                self.batch_limit,
            )
            .await
    }
}

/// The canonical rule ladder seeded for each tenant at provisioning.
pub fn default_rules() -> Vec<CreateRule> {
    use crate::models::InvoiceStatus;

    vec![
        CreateRule {
            name: "Unopened after a week".to_string(),
            reminder_type: "no_open".to_string(),
            trigger_conditions: vec![
                TriggerCondition::DaysSinceSent { days: 7 },
                TriggerCondition::StatusIn {
                    statuses: vec![InvoiceStatus::Sent],
                },
                TriggerCondition::Opened { value: false },
            ],
            action: RuleAction::Email {
                template: "reminder_no_open".to_string(),
            },
            cooldown_days: None,
            priority: 10,
        },
        CreateRule {
            name: "Opened without selecting a method".to_string(),
            reminder_type: "no_selection".to_string(),
            trigger_conditions: vec![
                TriggerCondition::DaysSinceSent { days: 14 },
                TriggerCondition::StatusIn {
                    statuses: vec![InvoiceStatus::Sent],
                },
                TriggerCondition::Opened { value: true },
                TriggerCondition::NoMethodSelected,
            ],
            action: RuleAction::Email {
                template: "reminder_no_selection".to_string(),
            },
            cooldown_days: None,
            priority: 20,
        },
        CreateRule {
            name: "Payment overdue".to_string(),
            reminder_type: "payment_overdue".to_string(),
            trigger_conditions: vec![
                TriggerCondition::DaysSinceSent { days: 30 },
                TriggerCondition::StatusIn {
                    statuses: vec![InvoiceStatus::Sent, InvoiceStatus::PartialPaid],
                },
            ],
            action: RuleAction::Email {
                template: "reminder_payment_overdue".to_string(),
            },
            cooldown_days: None,
            priority: 30,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InvoiceStatus;

    fn base_conditions() -> Vec<TriggerCondition> {
        vec![
            TriggerCondition::DaysSinceSent { days: 7 },
            TriggerCondition::StatusIn {
                statuses: vec![InvoiceStatus::Sent],
            },
        ]
    }

    #[test]
    fn compiles_minimal_conditions() {
        let trigger = CompiledTrigger::compile(&base_conditions()).unwrap();
        assert_eq!(trigger.days_since_sent, 7);
        assert_eq!(trigger.statuses, vec!["sent".to_string()]);
        assert_eq!(trigger.opened, None);
        assert!(!trigger.require_no_selection);
    }

    #[test]
    fn compiles_full_conditions() {
        let mut conditions = base_conditions();
        conditions.push(TriggerCondition::Opened { value: false });
        conditions.push(TriggerCondition::NoMethodSelected);

        let trigger = CompiledTrigger::compile(&conditions).unwrap();
        assert_eq!(trigger.opened, Some(false));
        assert!(trigger.require_no_selection);
    }

    #[test]
    fn rejects_missing_days() {
        let conditions = vec![TriggerCondition::StatusIn {
            statuses: vec![InvoiceStatus::Sent],
        }];
        let err = CompiledTrigger::compile(&conditions).unwrap_err();
        assert!(matches!(err, RuleError::MissingCondition("days_since_sent")));
    }

    #[test]
    fn rejects_missing_statuses() {
        let conditions = vec![TriggerCondition::DaysSinceSent { days: 7 }];
        let err = CompiledTrigger::compile(&conditions).unwrap_err();
        assert!(matches!(err, RuleError::MissingCondition("status_in")));
    }

    #[test]
    fn rejects_empty_status_set() {
        let conditions = vec![
            TriggerCondition::DaysSinceSent { days: 7 },
            TriggerCondition::StatusIn { statuses: vec![] },
        ];
        let err = CompiledTrigger::compile(&conditions).unwrap_err();
        assert!(matches!(err, RuleError::EmptyStatusSet));
    }

    #[test]
    fn rejects_duplicate_days() {
        let mut conditions = base_conditions();
        conditions.push(TriggerCondition::DaysSinceSent { days: 14 });
        let err = CompiledTrigger::compile(&conditions).unwrap_err();
        assert!(matches!(
            err,
            RuleError::DuplicateCondition("days_since_sent")
        ));
    }

    #[test]
    fn rejects_negative_days() {
        let conditions = vec![
            TriggerCondition::DaysSinceSent { days: -1 },
            TriggerCondition::StatusIn {
                statuses: vec![InvoiceStatus::Sent],
            },
        ];
        let err = CompiledTrigger::compile(&conditions).unwrap_err();
        assert!(matches!(err, RuleError::NegativeDays(-1)));
    }

    #[test]
    fn unknown_condition_kind_fails_parse() {
        // Unknown kinds must fail deserialization so the rule matches nothing
        let raw = serde_json::json!([
            { "kind": "days_since_sent", "days": 7 },
            { "kind": "zodiac_sign", "sign": "leo" }
        ]);
        let parsed: Result<Vec<TriggerCondition>, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn default_rules_all_compile() {
        for rule in default_rules() {
            CompiledTrigger::compile(&rule.trigger_conditions).unwrap();
        }
    }
}
