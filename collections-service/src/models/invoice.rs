//! Invoice model: a billable fee record tracked through its payment lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice payment lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    PartialPaid,
    Disputed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::PartialPaid => "partial_paid",
            InvoiceStatus::Disputed => "disputed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "sent" => InvoiceStatus::Sent,
            "paid" => InvoiceStatus::Paid,
            "partial_paid" => InvoiceStatus::PartialPaid,
            "disputed" => InvoiceStatus::Disputed,
            _ => InvoiceStatus::Draft,
        }
    }
}

/// Invoice row.
///
/// `amount_paid` never exceeds `total_amount`; status is `paid` exactly when
/// the two are equal. Invoices are never deleted, only status-transitioned.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub client_email: String,
    pub total_amount: Decimal,
    pub currency: String,
    pub status: String,
    pub amount_paid: Decimal,
    pub payment_method: Option<String>,
    pub method_selected_utc: Option<DateTime<Utc>>,
    pub sent_utc: Option<DateTime<Utc>>,
    pub last_reminder_utc: Option<DateTime<Utc>>,
    pub reminder_count: i32,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    /// Remaining balance against the undiscounted total.
    pub fn amount_due(&self) -> Decimal {
        self.total_amount - self.amount_paid
    }
}

/// Input for registering an invoice with the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoice {
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub client_email: String,
    pub total_amount: Decimal,
    pub currency: String,
}

/// Filter parameters for listing invoices.
#[derive(Debug, Clone, Default)]
pub struct ListInvoicesFilter {
    pub status: Option<InvoiceStatus>,
    pub client_id: Option<Uuid>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
