//! Payment lifecycle tracker: the state transitions of an invoice's payment
//! journey, shared between the HTTP surface and the reconciliation gateway.

use crate::models::{
    GatewayTransaction, Invoice, MethodSelection, NotificationRecord, PaymentMethod,
    SettlementResult,
};
use crate::services::metrics::{
    record_method_selection, record_notification_open, record_payment_amount,
};
use crate::services::Database;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Where a payment application came from, for the amount counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentSource {
    Gateway,
    Dispute,
}

impl PaymentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentSource::Gateway => "gateway",
            PaymentSource::Dispute => "dispute",
        }
    }
}

/// Records lifecycle transitions and keeps the counters honest.
#[derive(Clone)]
pub struct LifecycleService {
    db: Arc<Database>,
}

impl LifecycleService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The letter system reports a letter went out. Returns the invoice and
    /// the notification row whose id the letter embeds as its tracking pixel.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn record_sent(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<(Invoice, NotificationRecord), AppError> {
        self.db.record_invoice_sent(tenant_id, invoice_id).await
    }

    /// A tracking pixel fired. Safe under concurrent duplicates; unknown
    /// notification ids are swallowed by the caller (no oracle for probers).
    #[instrument(skip(self), fields(notification_id = %notification_id))]
    pub async fn record_open(
        &self,
        notification_id: Uuid,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let notification = self.db.record_open(notification_id).await?;
        if let Some(record) = &notification {
            record_notification_open(&record.tenant_id.to_string());
        }
        Ok(notification)
    }

    /// A client declared a payment channel from the emailed payment page.
    /// The link carries only the invoice id; the tenant comes from the
    /// invoice row. Methods outside the fixed set are rejected.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, method = %method_raw))]
    pub async fn select_method(
        &self,
        invoice_id: Uuid,
        method_raw: &str,
    ) -> Result<MethodSelection, AppError> {
        let method = PaymentMethod::parse(method_raw).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Invalid payment method: {}", method_raw))
        })?;

        let invoice = self
            .db
            .get_invoice_unscoped(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        let selection = self
            .db
            .upsert_method_selection(invoice.tenant_id, invoice_id, method)
            .await?;

        record_method_selection(&invoice.tenant_id.to_string(), method.as_str());

        Ok(selection)
    }

    /// The payment page opened a processor transaction. Pre-registers it as
    /// `pending` so the webhook can match it later; idempotent under page
    /// reloads. When no amount is given the selection's discounted amount is
    /// charged, falling back to the remaining balance.
    #[instrument(skip(self), fields(invoice_id = %invoice_id, transaction_id = %transaction_id))]
    pub async fn register_payment_started(
        &self,
        invoice_id: Uuid,
        transaction_id: &str,
        amount: Option<Decimal>,
    ) -> Result<GatewayTransaction, AppError> {
        let invoice = self
            .db
            .get_invoice_unscoped(invoice_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        let account = self
            .db
            .get_gateway_account_by_tenant(invoice.tenant_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "No payment terminal registered for this tenant"
                ))
            })?;

        let amount = match amount {
            Some(amount) => amount,
            None => match self
                .db
                .get_method_selection(invoice.tenant_id, invoice_id)
                .await?
            {
                Some(selection) => selection.amount_after_discount,
                None => invoice.amount_due(),
            },
        };

        self.db
            .register_gateway_transaction(
                invoice.tenant_id,
                invoice_id,
                transaction_id,
                &account.terminal_id,
                amount,
                &invoice.currency,
            )
            .await
    }

    /// Apply a confirmed processor completion. Exclusively driven by the
    /// reconciliation gateway so a client cannot self-declare success.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    pub async fn mark_completed(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
        response_code: &str,
    ) -> Result<SettlementResult, AppError> {
        let result = self
            .db
            .apply_gateway_success(tenant_id, transaction_id, response_code)
            .await?;

        if let SettlementResult::Applied {
            transaction,
            invoice,
        } = &result
        {
            record_payment_amount(
                &tenant_id.to_string(),
                &transaction.currency,
                PaymentSource::Gateway.as_str(),
                transaction.amount.to_f64().unwrap_or(0.0),
            );
            info!(
                transaction_id = %transaction_id,
                invoice_id = %invoice.invoice_id,
                invoice_status = %invoice.status,
                "Completion applied"
            );
        }

        Ok(result)
    }
}
