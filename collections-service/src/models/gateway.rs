//! Payment gateway accounts, transactions and webhook audit models.

use super::Invoice;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A tenant's terminal registration with the card processor. The terminal id
/// is what webhook deliveries carry, so it is the key used to resolve which
/// tenant (and which shared secret) a delivery belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GatewayAccount {
    pub account_id: Uuid,
    pub tenant_id: Uuid,
    pub terminal_id: String,
    pub webhook_secret: String,
    pub currency: String,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayTransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl GatewayTransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayTransactionStatus::Pending => "pending",
            GatewayTransactionStatus::Completed => "completed",
            GatewayTransactionStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "completed" => GatewayTransactionStatus::Completed,
            "failed" => GatewayTransactionStatus::Failed,
            _ => GatewayTransactionStatus::Pending,
        }
    }
}

/// A processor transaction tracked against an invoice. Registered as
/// `pending` when the client opens the payment page; webhook deliveries
/// settle it to `completed` or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GatewayTransaction {
    pub tenant_id: Uuid,
    pub transaction_id: String,
    pub invoice_id: Uuid,
    pub terminal_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub response_code: Option<String>,
    pub registered_utc: DateTime<Utc>,
    pub settled_utc: Option<DateTime<Utc>>,
}

impl GatewayTransaction {
    pub fn status(&self) -> GatewayTransactionStatus {
        GatewayTransactionStatus::from_string(&self.status)
    }
}

/// Result of settling a success notification against the transaction store.
#[derive(Debug, Clone)]
pub enum SettlementResult {
    /// No transaction registered under this id for the tenant.
    NotRegistered,
    /// Transaction was already completed; nothing was changed.
    AlreadyCompleted(GatewayTransaction),
    /// Transaction settled and the payment applied to its invoice.
    Applied {
        transaction: GatewayTransaction,
        invoice: Invoice,
    },
}

/// Terminal outcome of processing one webhook delivery. Every delivery gets
/// exactly one of these in the audit trail, including the ones we reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Success notification matched a transaction and updated the invoice.
    Applied,
    /// Transaction was already completed; nothing changed.
    Duplicate,
    /// Failure notification recorded against the transaction.
    FailureLogged,
    /// Terminal id resolves to no registered gateway account.
    UnknownTerminal,
    /// Signature verified but the transaction id is not registered.
    UnknownTransaction,
    /// HMAC signature did not verify against the account secret.
    BadSignature,
    /// Payload missing required fields or otherwise unparseable.
    Malformed,
    /// Internal failure while applying; delivery should be retried upstream.
    Error,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::FailureLogged => "failure_logged",
            WebhookOutcome::UnknownTerminal => "unknown_terminal",
            WebhookOutcome::UnknownTransaction => "unknown_transaction",
            WebhookOutcome::BadSignature => "bad_signature",
            WebhookOutcome::Malformed => "malformed",
            WebhookOutcome::Error => "error",
        }
    }
}

/// Audit row written for every webhook delivery, before any other handling.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookAuditRecord {
    pub audit_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub terminal_id: Option<String>,
    pub transaction_id: Option<String>,
    pub response_code: Option<String>,
    pub amount: Option<String>,
    pub signature_valid: Option<bool>,
    pub outcome: String,
    pub raw_payload: String,
    pub received_utc: DateTime<Utc>,
}

/// Fields pulled out of a processor notification body.
///
/// The processor posts form-encoded key/value pairs; only the fields the
/// reconciliation path needs are modelled, the full raw body goes to audit.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub terminal_id: String,
    pub transaction_id: String,
    pub response_code: String,
    pub amount: Decimal,
    pub currency: Option<String>,
}

impl WebhookPayload {
    /// Response code "0" is the processor's approval code; anything else is a
    /// decline or error class.
    pub fn is_success(&self) -> bool {
        self.response_code == "0"
    }
}
