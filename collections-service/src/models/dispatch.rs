//! Reminder dispatch log and batch run models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Dispatch row state. `Pending` rows are in-flight claims; only `Sent` rows
/// represent a confirmed reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Sent,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "pending",
            DispatchStatus::Sent => "sent",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => DispatchStatus::Sent,
            _ => DispatchStatus::Pending,
        }
    }
}

/// One row per reminder claim/send. Source of truth for "has this reminder
/// already fired" and for the cooldown window gating re-evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReminderDispatch {
    pub dispatch_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub rule_id: Uuid,
    pub reminder_type: String,
    pub reminder_sequence: i32,
    pub channel: String,
    pub status: String,
    pub notification_id: Option<Uuid>,
    pub claimed_utc: DateTime<Utc>,
    pub sent_utc: Option<DateTime<Utc>>,
}

/// How a reminder run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Scheduled,
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Scheduled => "scheduled",
            RunType::Manual => "manual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "manual" => RunType::Manual,
            _ => RunType::Scheduled,
        }
    }
}

/// Reminder run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Running,
        }
    }
}

/// Per-tick batch summary for operator review.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReminderRun {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub run_type: String,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub rules_evaluated: i32,
    pub invoices_matched: i32,
    pub dispatches_sent: i32,
    pub send_failures: i32,
    pub error_message: Option<String>,
}
