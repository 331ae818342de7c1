//! Payment dispute models.
//!
//! A dispute is a client's claim that an invoice the system considers unpaid
//! was in fact paid. A pending dispute keeps the invoice out of reminder
//! selection without touching its status; an operator resolves it after
//! checking records.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Pending,
    ResolvedPaid,
    ResolvedUnpaid,
    Invalid,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Pending => "pending",
            DisputeStatus::ResolvedPaid => "resolved_paid",
            DisputeStatus::ResolvedUnpaid => "resolved_unpaid",
            DisputeStatus::Invalid => "invalid",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "resolved_paid" => DisputeStatus::ResolvedPaid,
            "resolved_unpaid" => DisputeStatus::ResolvedUnpaid,
            "invalid" => DisputeStatus::Invalid,
            _ => DisputeStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dispute {
    pub dispute_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub claimed_paid_on: Option<NaiveDate>,
    pub claimed_method: Option<String>,
    pub claimed_amount: Option<Decimal>,
    pub claimed_reference: Option<String>,
    pub comment: Option<String>,
    pub status: String,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub submitted_utc: DateTime<Utc>,
    pub resolved_utc: Option<DateTime<Utc>>,
}

impl Dispute {
    pub fn status(&self) -> DisputeStatus {
        DisputeStatus::from_string(&self.status)
    }
}

/// Client-submitted dispute payload.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitDispute {
    pub invoice_id: Uuid,
    pub claimed_paid_on: Option<NaiveDate>,
    #[validate(length(max = 64))]
    pub claimed_method: Option<String>,
    pub claimed_amount: Option<Decimal>,
    #[validate(length(max = 256))]
    pub claimed_reference: Option<String>,
    #[validate(length(max = 2000))]
    pub comment: Option<String>,
}

/// Operator verdict on a pending dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Claim checks out: apply the claimed amount as a payment.
    ResolvedPaid,
    /// Claim does not check out: invoice returns to the reminder pipeline.
    ResolvedUnpaid,
    /// Spam or mistaken submission: no payment, invoice returns to the pipeline.
    Invalid,
}

impl DisputeResolution {
    pub fn status(&self) -> DisputeStatus {
        match self {
            DisputeResolution::ResolvedPaid => DisputeStatus::ResolvedPaid,
            DisputeResolution::ResolvedUnpaid => DisputeStatus::ResolvedUnpaid,
            DisputeResolution::Invalid => DisputeStatus::Invalid,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ResolveDispute {
    pub resolution: DisputeResolution,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}
