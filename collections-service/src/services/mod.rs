//! Services module for collections-service.

pub mod database;
pub mod dispatch;
pub mod lifecycle;
pub mod metrics;
pub mod reconcile;
pub mod rules;
pub mod scheduler;
pub mod sender;

pub use database::Database;
pub use dispatch::{DispatchOutcome, Dispatcher, TickSummary};
pub use lifecycle::{LifecycleService, PaymentSource};
pub use metrics::{
    get_metrics, init_metrics, record_dispute_operation, record_method_selection,
    record_notification_open, record_payment_amount, record_reminder_dispatched,
    record_reminder_run, record_rule_compile_failure, record_send_failure,
    record_webhook_delivery,
};
pub use reconcile::{Reconciler, WEBHOOK_ACK};
pub use rules::{default_rules, CompiledTrigger, RuleEngine, RuleError};
pub use scheduler::Scheduler;
pub use sender::{
    HttpLetterSender, LetterRequest, LetterSender, MockLetterSender, SendReceipt, SenderError,
};
