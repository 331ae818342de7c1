//! Reminder rule model: tenant-scoped declarative trigger definitions.

use super::InvoiceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One condition of a rule's trigger predicate. Conditions combine as a
/// conjunction; unknown kinds fail deserialization, which the engine treats
/// as matching nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Invoice letter went out at least this many days ago.
    DaysSinceSent { days: i64 },
    /// Invoice status is one of the listed values.
    StatusIn { statuses: Vec<InvoiceStatus> },
    /// Whether the invoice letter has been opened.
    Opened { value: bool },
    /// No payment method has been selected yet.
    NoMethodSelected,
}

/// The side effect a rule performs on match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Send a reminder letter through the letter capability.
    Email { template: String },
    /// Record the dispatch without sending anything.
    LogOnly,
}

impl RuleAction {
    pub fn channel(&self) -> &'static str {
        match self {
            RuleAction::Email { .. } => "email",
            RuleAction::LogOnly => "log",
        }
    }
}

/// Reminder rule row. Predicate and action persist as JSONB; parsing happens
/// at evaluation time so a malformed row degrades to "matches nothing"
/// instead of poisoning the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReminderRule {
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub reminder_type: String,
    pub trigger_conditions: serde_json::Value,
    pub action: serde_json::Value,
    pub cooldown_days: Option<i32>,
    pub is_active: bool,
    pub priority: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a rule.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRule {
    pub name: String,
    pub reminder_type: String,
    pub trigger_conditions: Vec<TriggerCondition>,
    pub action: RuleAction,
    pub cooldown_days: Option<i32>,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    100
}

/// Input for updating a rule. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRule {
    pub name: Option<String>,
    pub trigger_conditions: Option<Vec<TriggerCondition>>,
    pub action: Option<RuleAction>,
    pub cooldown_days: Option<i32>,
    pub priority: Option<i32>,
}
