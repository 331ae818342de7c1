//! Metrics module for collections-service.
//! Provides Prometheus metrics for reminder dispatch, payment reconciliation
//! and per-tenant metering.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "collections_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Reminders dispatched counter (per-tenant metering)
pub static REMINDERS_DISPATCHED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reminder send failures counter
pub static SEND_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook deliveries counter by outcome
pub static WEBHOOK_DELIVERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Notification opens counter (per-tenant metering)
pub static NOTIFICATION_OPENS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment method selections counter (per-tenant metering)
pub static METHOD_SELECTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Dispute operations counter (per-tenant metering)
pub static DISPUTE_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Rule compile failures counter for alerting on bad rule definitions
pub static RULE_COMPILE_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reminder runs counter (per-tenant metering)
pub static REMINDER_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment amount counter by currency (monetary tracking)
pub static PAYMENT_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    // Reminders dispatched
    REMINDERS_DISPATCHED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_reminders_dispatched_total",
                "Total reminders dispatched by tenant and reminder type"
            ),
            &["tenant_id", "reminder_type"]
        )
        .expect("Failed to register REMINDERS_DISPATCHED_TOTAL")
    });

    // Send failures
    SEND_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_send_failures_total",
                "Total reminder send failures by tenant and reminder type"
            ),
            &["tenant_id", "reminder_type"]
        )
        .expect("Failed to register SEND_FAILURES_TOTAL")
    });

    // Webhook deliveries
    WEBHOOK_DELIVERIES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_webhook_deliveries_total",
                "Total processor webhook deliveries by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register WEBHOOK_DELIVERIES_TOTAL")
    });

    // Notification opens
    NOTIFICATION_OPENS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_notification_opens_total",
                "Total tracked notification opens by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register NOTIFICATION_OPENS_TOTAL")
    });

    // Method selections
    METHOD_SELECTIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_method_selections_total",
                "Total payment method selections by tenant and method"
            ),
            &["tenant_id", "method"]
        )
        .expect("Failed to register METHOD_SELECTIONS_TOTAL")
    });

    // Dispute operations
    DISPUTE_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_dispute_operations_total",
                "Total dispute operations by tenant and operation type"
            ),
            &["tenant_id", "operation"]
        )
        .expect("Failed to register DISPUTE_OPERATIONS_TOTAL")
    });

    // Rule compile failures for alerting
    RULE_COMPILE_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_rule_compile_failures_total",
                "Total rule definitions that failed to compile, by tenant"
            ),
            &["tenant_id"]
        )
        .expect("Failed to register RULE_COMPILE_FAILURES_TOTAL")
    });

    // Reminder runs
    REMINDER_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "collections_reminder_runs_total",
                "Total reminder runs by tenant, run type and status"
            ),
            &["tenant_id", "run_type", "status"]
        )
        .expect("Failed to register REMINDER_RUNS_TOTAL")
    });

    // Payment amount counter for financial tracking
    PAYMENT_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "collections_payment_amount_total",
                "Total payment amount applied by currency and source"
            ),
            &["tenant_id", "currency", "source"]
        )
        .expect("Failed to register PAYMENT_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}

/// Record a dispatched reminder.
pub fn record_reminder_dispatched(tenant_id: &str, reminder_type: &str) {
    if let Some(counter) = REMINDERS_DISPATCHED_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, reminder_type])
            .inc();
    }
}

/// Record a reminder send failure.
pub fn record_send_failure(tenant_id: &str, reminder_type: &str) {
    if let Some(counter) = SEND_FAILURES_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, reminder_type])
            .inc();
    }
}

/// Record a webhook delivery outcome.
pub fn record_webhook_delivery(outcome: &str) {
    if let Some(counter) = WEBHOOK_DELIVERIES_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a tracked notification open.
pub fn record_notification_open(tenant_id: &str) {
    if let Some(counter) = NOTIFICATION_OPENS_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
}

/// Record a payment method selection.
pub fn record_method_selection(tenant_id: &str, method: &str) {
    if let Some(counter) = METHOD_SELECTIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, method]).inc();
    }
}

/// Record a dispute operation.
pub fn record_dispute_operation(tenant_id: &str, operation: &str) {
    if let Some(counter) = DISPUTE_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, operation]).inc();
    }
}

/// Record a rule that failed to compile.
pub fn record_rule_compile_failure(tenant_id: &str) {
    if let Some(counter) = RULE_COMPILE_FAILURES_TOTAL.get() {
        counter.with_label_values(&[tenant_id]).inc();
    }
}

/// Record a reminder run.
pub fn record_reminder_run(tenant_id: &str, run_type: &str, status: &str) {
    if let Some(counter) = REMINDER_RUNS_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, run_type, status])
            .inc();
    }
}

/// Record a payment amount for financial tracking.
pub fn record_payment_amount(tenant_id: &str, currency: &str, source: &str, amount: f64) {
    if let Some(counter) = PAYMENT_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[tenant_id, currency, source])
            .inc_by(amount.abs());
    }
}
