//! Domain models for collections-service.

mod dispatch;
mod dispute;
mod gateway;
mod invoice;
mod notification;
mod rule;
mod selection;

pub use dispatch::{DispatchStatus, ReminderDispatch, ReminderRun, RunStatus, RunType};
pub use dispute::{Dispute, DisputeResolution, DisputeStatus, ResolveDispute, SubmitDispute};
pub use gateway::{
    GatewayAccount, GatewayTransaction, GatewayTransactionStatus, SettlementResult,
    WebhookAuditRecord, WebhookOutcome, WebhookPayload,
};
pub use invoice::{CreateInvoice, Invoice, InvoiceStatus, ListInvoicesFilter};
pub use notification::NotificationRecord;
pub use rule::{CreateRule, ReminderRule, RuleAction, TriggerCondition, UpdateRule};
pub use selection::{MethodSelection, PaymentMethod};
