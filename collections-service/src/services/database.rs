//! Database service for collections-service.

use crate::models::{
    CreateInvoice, CreateRule, Dispute, DisputeResolution, GatewayAccount, GatewayTransaction,
    GatewayTransactionStatus, Invoice, InvoiceStatus, ListInvoicesFilter, MethodSelection,
    NotificationRecord, PaymentMethod, ReminderDispatch, ReminderRule, ReminderRun,
    RunStatus, RunType, SettlementResult, SubmitDispute, UpdateRule, WebhookAuditRecord,
    WebhookOutcome,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "collections-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    /// Register a calculated fee record with the engine.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let invoice_id = Uuid::new_v4();
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, client_id, client_email, total_amount, currency)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            "#,
        )
        .bind(invoice_id)
        .bind(input.tenant_id)
        .bind(input.client_id)
        .bind(&input.client_email)
        .bind(input.total_amount)
        .bind(&input.currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)))?;

        timer.observe_duration();
        info!(invoice_id = %invoice.invoice_id, total_amount = %invoice.total_amount, "Invoice created");

        Ok(invoice)
    }

    /// Get an invoice by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// Look up an invoice by id alone. For the unauthenticated tracking
    /// endpoints, where the emailed link carries only the invoice id and the
    /// tenant comes from the row itself.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice_unscoped(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_unscoped"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))?;

        timer.observe_duration();

        Ok(invoice)
    }

    /// List invoices with optional status/client filters and cursor pagination.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn list_invoices(
        &self,
        tenant_id: Uuid,
        filter: &ListInvoicesFilter,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let status = filter.status.map(|s| s.as_str());

        let invoices = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Invoice>(
                r#"
                SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
                FROM invoices
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR client_id = $3)
                  AND invoice_id > $4
                ORDER BY invoice_id
                LIMIT $5
                "#,
            )
            .bind(tenant_id)
            .bind(status)
            .bind(filter.client_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Invoice>(
                r#"
                SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
                FROM invoices
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR status = $2)
                  AND ($3::uuid IS NULL OR client_id = $3)
                ORDER BY invoice_id
                LIMIT $4
                "#,
            )
            .bind(tenant_id)
            .bind(status)
            .bind(filter.client_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoices: {}", e)))?;

        timer.observe_duration();

        Ok(invoices)
    }

    /// Record that a letter went out for this invoice: transitions draft to
    /// sent, stamps sent_utc on the first call only, and appends the
    /// notification row whose id the letter embeds as its tracking pixel.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn record_invoice_sent(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<(Invoice, NotificationRecord), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_invoice_sent"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let current = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        if current.status() == InvoiceStatus::Paid {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is already paid",
                invoice_id
            )));
        }

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET status = CASE WHEN status = 'draft' THEN 'sent' ELSE status END,
                sent_utc = COALESCE(sent_utc, $3),
                updated_utc = $3
            WHERE tenant_id = $1 AND invoice_id = $2
            RETURNING invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to mark invoice sent: {}", e)))?;

        let notification_id = Uuid::new_v4();
        let notification = sqlx::query_as::<_, NotificationRecord>(
            r#"
            INSERT INTO notifications (notification_id, tenant_id, invoice_id, sent_utc)
            VALUES ($1, $2, $3, $4)
            RETURNING notification_id, tenant_id, invoice_id, sent_utc, opened_utc, last_opened_utc, open_count
            "#,
        )
        .bind(notification_id)
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create notification: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice_id,
            notification_id = %notification_id,
            status = %invoice.status,
            "Letter recorded for invoice"
        );

        Ok((invoice, notification))
    }

    // =========================================================================
    // Notification Operations
    // =========================================================================

    /// Record a tracking-pixel open. Single atomic increment: concurrent
    /// duplicate opens never lose counts, and opened_utc keeps the first
    /// open's timestamp.
    #[instrument(skip(self), fields(notification_id = %notification_id))]
    pub async fn record_open(
        &self,
        notification_id: Uuid,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_open"])
            .start_timer();

        let now = Utc::now();
        let notification = sqlx::query_as::<_, NotificationRecord>(
            r#"
            UPDATE notifications
            SET open_count = open_count + 1,
                opened_utc = COALESCE(opened_utc, $2),
                last_opened_utc = $2
            WHERE notification_id = $1
            RETURNING notification_id, tenant_id, invoice_id, sent_utc, opened_utc, last_opened_utc, open_count
            "#,
        )
        .bind(notification_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record open: {}", e)))?;

        timer.observe_duration();

        Ok(notification)
    }

    /// Get a notification by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, notification_id = %notification_id))]
    pub async fn get_notification(
        &self,
        tenant_id: Uuid,
        notification_id: Uuid,
    ) -> Result<Option<NotificationRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_notification"])
            .start_timer();

        let notification = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT notification_id, tenant_id, invoice_id, sent_utc, opened_utc, last_opened_utc, open_count
            FROM notifications
            WHERE tenant_id = $1 AND notification_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get notification: {}", e)))?;

        timer.observe_duration();

        Ok(notification)
    }

    /// List the notifications sent for an invoice, oldest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn list_notifications(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_notifications"])
            .start_timer();

        let notifications = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT notification_id, tenant_id, invoice_id, sent_utc, opened_utc, last_opened_utc, open_count
            FROM notifications
            WHERE tenant_id = $1 AND invoice_id = $2
            ORDER BY sent_utc
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list notifications: {}", e))
        })?;

        timer.observe_duration();

        Ok(notifications)
    }

    // =========================================================================
    // Method Selection Operations
    // =========================================================================

    /// Get an invoice's payment method selection.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn get_method_selection(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<MethodSelection>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_method_selection"])
            .start_timer();

        let selection = sqlx::query_as::<_, MethodSelection>(
            r#"
            SELECT invoice_id, tenant_id, client_id, selected_method, original_amount, discount_percent, amount_after_discount, selected_utc, completed_payment, payment_transaction_id
            FROM method_selections
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get method selection: {}", e))
        })?;

        timer.observe_duration();

        Ok(selection)
    }

    /// Upsert a payment method selection for an invoice. Last write wins on
    /// re-selection, except a selection whose payment already completed is
    /// never overwritten. Stamps the denormalized method fields on the
    /// invoice in the same transaction.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id, method = %method.as_str()))]
    pub async fn upsert_method_selection(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        method: PaymentMethod,
    ) -> Result<MethodSelection, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_method_selection"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        if invoice.status() == InvoiceStatus::Paid {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is already paid",
                invoice_id
            )));
        }

        let discount_percent = method.discount_percent();
        let amount_after_discount = method.discounted_amount(invoice.total_amount);

        let selection = sqlx::query_as::<_, MethodSelection>(
            r#"
            INSERT INTO method_selections (invoice_id, tenant_id, client_id, selected_method, original_amount, discount_percent, amount_after_discount, selected_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (invoice_id) DO UPDATE
            SET selected_method = EXCLUDED.selected_method,
                original_amount = EXCLUDED.original_amount,
                discount_percent = EXCLUDED.discount_percent,
                amount_after_discount = EXCLUDED.amount_after_discount,
                selected_utc = EXCLUDED.selected_utc
            WHERE method_selections.completed_payment = FALSE
            RETURNING invoice_id, tenant_id, client_id, selected_method, original_amount, discount_percent, amount_after_discount, selected_utc, completed_payment, payment_transaction_id
            "#,
        )
        .bind(invoice_id)
        .bind(tenant_id)
        .bind(invoice.client_id)
        .bind(method.as_str())
        .bind(invoice.total_amount)
        .bind(discount_percent)
        .bind(amount_after_discount)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to upsert method selection: {}", e))
        })?;

        let Some(selection) = selection else {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment already completed for invoice {}",
                invoice_id
            )));
        };

        sqlx::query(
            r#"
            UPDATE invoices
            SET payment_method = $3, method_selected_utc = $4, updated_utc = $4
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(method.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to stamp invoice method: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice_id,
            method = %method.as_str(),
            amount_after_discount = %amount_after_discount,
            "Payment method selected"
        );

        Ok(selection)
    }

    // =========================================================================
    // Gateway Operations
    // =========================================================================

    /// Register a processor terminal for a tenant.
    #[instrument(skip(self, webhook_secret), fields(tenant_id = %tenant_id, terminal_id = %terminal_id))]
    pub async fn create_gateway_account(
        &self,
        tenant_id: Uuid,
        terminal_id: &str,
        webhook_secret: &str,
        currency: &str,
    ) -> Result<GatewayAccount, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_gateway_account"])
            .start_timer();

        let account_id = Uuid::new_v4();
        let result = sqlx::query_as::<_, GatewayAccount>(
            r#"
            INSERT INTO gateway_accounts (account_id, tenant_id, terminal_id, webhook_secret, currency)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING account_id, tenant_id, terminal_id, webhook_secret, currency, created_utc
            "#,
        )
        .bind(account_id)
        .bind(tenant_id)
        .bind(terminal_id)
        .bind(webhook_secret)
        .bind(currency)
        .fetch_one(&self.pool)
        .await;

        let account = match result {
            Ok(account) => account,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Terminal {} is already registered",
                    terminal_id
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create gateway account: {}",
                    e
                )));
            }
        };

        timer.observe_duration();
        info!(account_id = %account.account_id, "Gateway account registered");

        Ok(account)
    }

    /// Resolve the gateway account for a processor terminal. Not tenant
    /// scoped: the terminal id is how webhook deliveries identify the tenant.
    #[instrument(skip(self), fields(terminal_id = %terminal_id))]
    pub async fn get_gateway_account_by_terminal(
        &self,
        terminal_id: &str,
    ) -> Result<Option<GatewayAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_gateway_account_by_terminal"])
            .start_timer();

        let account = sqlx::query_as::<_, GatewayAccount>(
            r#"
            SELECT account_id, tenant_id, terminal_id, webhook_secret, currency, created_utc
            FROM gateway_accounts
            WHERE terminal_id = $1
            "#,
        )
        .bind(terminal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get gateway account: {}", e))
        })?;

        timer.observe_duration();

        Ok(account)
    }

    /// Get the gateway account provisioned for a tenant. The oldest terminal
    /// wins when several are registered.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn get_gateway_account_by_tenant(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<GatewayAccount>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_gateway_account_by_tenant"])
            .start_timer();

        let account = sqlx::query_as::<_, GatewayAccount>(
            r#"
            SELECT account_id, tenant_id, terminal_id, webhook_secret, currency, created_utc
            FROM gateway_accounts
            WHERE tenant_id = $1
            ORDER BY created_utc
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get gateway account: {}", e))
        })?;

        timer.observe_duration();

        Ok(account)
    }

    /// Register the processor transaction a payment page just opened, as
    /// `pending`. Idempotent: re-registering the same transaction id returns
    /// the existing row unchanged.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id, transaction_id = %transaction_id))]
    pub async fn register_gateway_transaction(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        transaction_id: &str,
        terminal_id: &str,
        amount: Decimal,
        currency: &str,
    ) -> Result<GatewayTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["register_gateway_transaction"])
            .start_timer();

        let result = sqlx::query_as::<_, GatewayTransaction>(
            r#"
            INSERT INTO gateway_transactions (transaction_id, tenant_id, invoice_id, terminal_id, amount, currency)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING transaction_id, tenant_id, invoice_id, terminal_id, amount, currency, status, response_code, registered_utc, settled_utc
            "#,
        )
        .bind(transaction_id)
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(terminal_id)
        .bind(amount)
        .bind(currency)
        .fetch_one(&self.pool)
        .await;

        let transaction = match result {
            Ok(transaction) => transaction,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Payment page reloaded: the transaction is already tracked
                let existing = self
                    .get_gateway_transaction(tenant_id, transaction_id)
                    .await?;
                timer.observe_duration();
                return existing.ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!(
                        "Transaction {} vanished after conflict",
                        transaction_id
                    ))
                });
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to register transaction: {}",
                    e
                )));
            }
        };

        timer.observe_duration();
        info!(transaction_id = %transaction_id, amount = %amount, "Gateway transaction registered");

        Ok(transaction)
    }

    /// Get a gateway transaction by its processor identifier.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    pub async fn get_gateway_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> Result<Option<GatewayTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_gateway_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, GatewayTransaction>(
            r#"
            SELECT transaction_id, tenant_id, invoice_id, terminal_id, amount, currency, status, response_code, registered_utc, settled_utc
            FROM gateway_transactions
            WHERE tenant_id = $1 AND transaction_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to get transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(transaction)
    }

    /// Apply a successful processor notification exactly once. Locks the
    /// registered transaction row; an already-completed row short-circuits to
    /// a no-op so duplicate deliveries never double-count. Otherwise settles
    /// the transaction, applies its registered amount to the invoice and
    /// flips the matching selection, all in one transaction.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    pub async fn apply_gateway_success(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
        response_code: &str,
    ) -> Result<SettlementResult, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_gateway_success"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let registered = sqlx::query_as::<_, GatewayTransaction>(
            r#"
            SELECT transaction_id, tenant_id, invoice_id, terminal_id, amount, currency, status, response_code, registered_utc, settled_utc
            FROM gateway_transactions
            WHERE tenant_id = $1 AND transaction_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to lock transaction: {}", e))
        })?;

        let Some(registered) = registered else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(SettlementResult::NotRegistered);
        };

        if registered.status() == GatewayTransactionStatus::Completed {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(SettlementResult::AlreadyCompleted(registered));
        }

        let transaction = sqlx::query_as::<_, GatewayTransaction>(
            r#"
            UPDATE gateway_transactions
            SET status = 'completed', response_code = $3, settled_utc = $4
            WHERE tenant_id = $1 AND transaction_id = $2
            RETURNING transaction_id, tenant_id, invoice_id, terminal_id, amount, currency, status, response_code, registered_utc, settled_utc
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(response_code)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to settle transaction: {}", e))
        })?;

        // Old amount_paid in the CASE: paid only when this payment reaches
        // the full undiscounted total
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices
            SET amount_paid = LEAST(total_amount, amount_paid + $3),
                status = CASE WHEN amount_paid + $3 >= total_amount THEN 'paid' ELSE 'partial_paid' END,
                updated_utc = $4
            WHERE tenant_id = $1 AND invoice_id = $2
            RETURNING invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(transaction.invoice_id)
        .bind(transaction.amount)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to apply payment: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE method_selections
            SET completed_payment = TRUE, payment_transaction_id = $3
            WHERE tenant_id = $1 AND invoice_id = $2 AND completed_payment = FALSE
            "#,
        )
        .bind(tenant_id)
        .bind(transaction.invoice_id)
        .bind(transaction_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to flip selection: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            transaction_id = %transaction_id,
            invoice_id = %transaction.invoice_id,
            amount = %transaction.amount,
            status = %invoice.status,
            "Payment applied from gateway"
        );

        Ok(SettlementResult::Applied {
            transaction,
            invoice,
        })
    }

    /// Record a failed processor notification against the registered
    /// transaction. A completed transaction is never downgraded; the invoice
    /// is never mutated by failures.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, transaction_id = %transaction_id))]
    pub async fn record_gateway_failure(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
        response_code: &str,
    ) -> Result<Option<GatewayTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_gateway_failure"])
            .start_timer();

        let now = Utc::now();
        let transaction = sqlx::query_as::<_, GatewayTransaction>(
            r#"
            UPDATE gateway_transactions
            SET status = 'failed', response_code = $3, settled_utc = $4
            WHERE tenant_id = $1 AND transaction_id = $2 AND status <> 'completed'
            RETURNING transaction_id, tenant_id, invoice_id, terminal_id, amount, currency, status, response_code, registered_utc, settled_utc
            "#,
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .bind(response_code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to record gateway failure: {}", e))
        })?;

        timer.observe_duration();

        Ok(transaction)
    }

    // =========================================================================
    // Webhook Audit Operations
    // =========================================================================

    /// Append the raw webhook payload to the audit trail. Written before any
    /// parsing or verification so every delivery is forensically recoverable.
    #[instrument(skip(self, raw_payload))]
    pub async fn insert_webhook_audit(&self, raw_payload: &str) -> Result<Uuid, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_webhook_audit"])
            .start_timer();

        let audit_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO webhook_audit (audit_id, outcome, raw_payload)
            VALUES ($1, 'received', $2)
            "#,
        )
        .bind(audit_id)
        .bind(raw_payload)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to insert webhook audit: {}", e))
        })?;

        timer.observe_duration();

        Ok(audit_id)
    }

    /// Finalize a webhook audit row with the terminal outcome and whatever
    /// fields parsing recovered.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(audit_id = %audit_id, outcome = %outcome.as_str()))]
    pub async fn finalize_webhook_audit(
        &self,
        audit_id: Uuid,
        outcome: WebhookOutcome,
        tenant_id: Option<Uuid>,
        terminal_id: Option<&str>,
        transaction_id: Option<&str>,
        response_code: Option<&str>,
        amount: Option<&str>,
        signature_valid: Option<bool>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_webhook_audit"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE webhook_audit
            SET outcome = $2, tenant_id = $3, terminal_id = $4, transaction_id = $5, response_code = $6, amount = $7, signature_valid = $8
            WHERE audit_id = $1
            "#,
        )
        .bind(audit_id)
        .bind(outcome.as_str())
        .bind(tenant_id)
        .bind(terminal_id)
        .bind(transaction_id)
        .bind(response_code)
        .bind(amount)
        .bind(signature_valid)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to finalize webhook audit: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    /// List webhook audit rows for forensic review, cursor-paged.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_webhook_audit(
        &self,
        tenant_id: Uuid,
        outcome: Option<&str>,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<Vec<WebhookAuditRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_webhook_audit"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let records = if let Some(cursor) = page_token {
            sqlx::query_as::<_, WebhookAuditRecord>(
                r#"
                SELECT audit_id, tenant_id, terminal_id, transaction_id, response_code, amount, signature_valid, outcome, raw_payload, received_utc
                FROM webhook_audit
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR outcome = $2)
                  AND audit_id > $3
                ORDER BY audit_id
                LIMIT $4
                "#,
            )
            .bind(tenant_id)
            .bind(outcome)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, WebhookAuditRecord>(
                r#"
                SELECT audit_id, tenant_id, terminal_id, transaction_id, response_code, amount, signature_valid, outcome, raw_payload, received_utc
                FROM webhook_audit
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR outcome = $2)
                ORDER BY audit_id
                LIMIT $3
                "#,
            )
            .bind(tenant_id)
            .bind(outcome)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list webhook audit: {}", e))
        })?;

        timer.observe_duration();

        Ok(records)
    }

    // =========================================================================
    // Rule Operations
    // =========================================================================

    /// Create a reminder rule.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, name = %input.name))]
    pub async fn create_rule(
        &self,
        tenant_id: Uuid,
        input: &CreateRule,
    ) -> Result<ReminderRule, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_rule"])
            .start_timer();

        let trigger_conditions = serde_json::to_value(&input.trigger_conditions).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Invalid trigger conditions: {}", e))
        })?;
        let action = serde_json::to_value(&input.action)
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid action: {}", e)))?;

        let rule_id = Uuid::new_v4();
        let result = sqlx::query_as::<_, ReminderRule>(
            r#"
            INSERT INTO reminder_rules (rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, priority)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, is_active, priority, created_utc, updated_utc
            "#,
        )
        .bind(rule_id)
        .bind(tenant_id)
        .bind(&input.name)
        .bind(&input.reminder_type)
        .bind(&trigger_conditions)
        .bind(&action)
        .bind(input.cooldown_days)
        .bind(input.priority)
        .fetch_one(&self.pool)
        .await;

        let rule = match result {
            Ok(rule) => rule,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Rule '{}' already exists for reminder type '{}'",
                    input.name,
                    input.reminder_type
                )));
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create rule: {}",
                    e
                )));
            }
        };

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, reminder_type = %rule.reminder_type, "Rule created");

        Ok(rule)
    }

    /// Get a rule by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, rule_id = %rule_id))]
    pub async fn get_rule(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<ReminderRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_rule"])
            .start_timer();

        let rule = sqlx::query_as::<_, ReminderRule>(
            r#"
            SELECT rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, is_active, priority, created_utc, updated_utc
            FROM reminder_rules
            WHERE tenant_id = $1 AND rule_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get rule: {}", e)))?;

        timer.observe_duration();

        Ok(rule)
    }

    /// List all rules for a tenant, evaluation order first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_rules(&self, tenant_id: Uuid) -> Result<Vec<ReminderRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rules"])
            .start_timer();

        let rules = sqlx::query_as::<_, ReminderRule>(
            r#"
            SELECT rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, is_active, priority, created_utc, updated_utc
            FROM reminder_rules
            WHERE tenant_id = $1
            ORDER BY priority, created_utc
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list rules: {}", e)))?;

        timer.observe_duration();

        Ok(rules)
    }

    /// List active rules for a tenant in ascending priority.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_active_rules(&self, tenant_id: Uuid) -> Result<Vec<ReminderRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_rules"])
            .start_timer();

        let rules = sqlx::query_as::<_, ReminderRule>(
            r#"
            SELECT rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, is_active, priority, created_utc, updated_utc
            FROM reminder_rules
            WHERE tenant_id = $1 AND is_active = TRUE
            ORDER BY priority, created_utc
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list active rules: {}", e))
        })?;

        timer.observe_duration();

        Ok(rules)
    }

    /// Update a rule. Absent fields keep their current value.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, rule_id = %rule_id))]
    pub async fn update_rule(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        input: &UpdateRule,
    ) -> Result<Option<ReminderRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_rule"])
            .start_timer();

        let trigger_conditions = input
            .trigger_conditions
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| {
                AppError::BadRequest(anyhow::anyhow!("Invalid trigger conditions: {}", e))
            })?;
        let action = input
            .action
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!("Invalid action: {}", e)))?;

        let rule = sqlx::query_as::<_, ReminderRule>(
            r#"
            UPDATE reminder_rules
            SET name = COALESCE($3, name),
                trigger_conditions = COALESCE($4, trigger_conditions),
                action = COALESCE($5, action),
                cooldown_days = COALESCE($6, cooldown_days),
                priority = COALESCE($7, priority),
                updated_utc = $8
            WHERE tenant_id = $1 AND rule_id = $2
            RETURNING rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, is_active, priority, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .bind(&input.name)
        .bind(&trigger_conditions)
        .bind(&action)
        .bind(input.cooldown_days)
        .bind(input.priority)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update rule: {}", e)))?;

        timer.observe_duration();

        Ok(rule)
    }

    /// Soft-enable or soft-disable a rule. Rules are never hard-deleted.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, rule_id = %rule_id, active = active))]
    pub async fn set_rule_active(
        &self,
        tenant_id: Uuid,
        rule_id: Uuid,
        active: bool,
    ) -> Result<Option<ReminderRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_rule_active"])
            .start_timer();

        let rule = sqlx::query_as::<_, ReminderRule>(
            r#"
            UPDATE reminder_rules
            SET is_active = $3, updated_utc = $4
            WHERE tenant_id = $1 AND rule_id = $2
            RETURNING rule_id, tenant_id, name, reminder_type, trigger_conditions, action, cooldown_days, is_active, priority, created_utc, updated_utc
            "#,
        )
        .bind(tenant_id)
        .bind(rule_id)
        .bind(active)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to set rule active: {}", e))
        })?;

        timer.observe_duration();

        Ok(rule)
    }

    /// Tenants with at least one active rule, for the batch scheduler.
    #[instrument(skip(self))]
    pub async fn list_rule_tenants(&self) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rule_tenants"])
            .start_timer();

        let tenants = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT tenant_id
            FROM reminder_rules
            WHERE is_active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list rule tenants: {}", e))
        })?;

        timer.observe_duration();

        Ok(tenants)
    }

    // =========================================================================
    // Candidate Selection
    // =========================================================================

    /// Select invoices a compiled trigger currently matches, excluding any
    /// with an in-flight claim or a sent dispatch of the same reminder type
    /// inside the cooldown window. Invoices with a pending dispute are held
    /// out until staff resolves the claim. Read-only: re-running without a
    /// dispatch in between returns the same set.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, statuses), fields(tenant_id = %tenant_id, reminder_type = %reminder_type))]
    pub async fn select_reminder_candidates(
        &self,
        tenant_id: Uuid,
        statuses: &[String],
        sent_cutoff: DateTime<Utc>,
        opened: Option<bool>,
        require_no_selection: bool,
        reminder_type: &str,
        cooldown_cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["select_reminder_candidates"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT i.invoice_id, i.tenant_id, i.client_id, i.client_email, i.total_amount, i.currency, i.status, i.amount_paid, i.payment_method, i.method_selected_utc, i.sent_utc, i.last_reminder_utc, i.reminder_count, i.created_utc, i.updated_utc
            FROM invoices i
            WHERE i.tenant_id = $1
              AND i.status = ANY($2)
              AND i.sent_utc IS NOT NULL
              AND i.sent_utc <= $3
              AND ($4::boolean IS NULL OR $4 = EXISTS (
                  SELECT 1 FROM notifications n
                  WHERE n.tenant_id = i.tenant_id
                    AND n.invoice_id = i.invoice_id
                    AND n.opened_utc IS NOT NULL))
              AND (NOT $5 OR i.payment_method IS NULL)
              AND NOT EXISTS (
                  SELECT 1 FROM reminder_dispatches d
                  WHERE d.tenant_id = i.tenant_id
                    AND d.invoice_id = i.invoice_id
                    AND d.reminder_type = $6
                    AND (d.status = 'pending' OR d.sent_utc > $7))
              AND NOT EXISTS (
                  SELECT 1 FROM disputes dp
                  WHERE dp.tenant_id = i.tenant_id
                    AND dp.invoice_id = i.invoice_id
                    AND dp.status = 'pending')
            ORDER BY i.sent_utc
            LIMIT $8
            "#,
        )
        .bind(tenant_id)
        .bind(statuses)
        .bind(sent_cutoff)
        .bind(opened)
        .bind(require_no_selection)
        .bind(reminder_type)
        .bind(cooldown_cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to select candidates: {}", e))
        })?;

        timer.observe_duration();

        Ok(invoices)
    }

    // =========================================================================
    // Dispatch Operations
    // =========================================================================

    /// Atomically claim a reminder dispatch for an invoice. Takes the invoice
    /// row lock, re-checks status, dispute hold, and cooldown against the
    /// dispatch log, and inserts a `pending` claim (plus the notification row
    /// for letter channels). Concurrent batches serialize on the row lock;
    /// the partial unique index on pending claims backstops them. Returns
    /// None when the invoice is no longer claimable.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, statuses), fields(tenant_id = %tenant_id, invoice_id = %invoice_id, reminder_type = %reminder_type))]
    pub async fn claim_dispatch(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        rule_id: Uuid,
        reminder_type: &str,
        channel: &str,
        statuses: &[String],
        cooldown_cutoff: DateTime<Utc>,
        with_notification: bool,
    ) -> Result<Option<(ReminderDispatch, Option<NotificationRecord>, Invoice)>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_dispatch"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?;

        let Some(invoice) = invoice else {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        // Status may have moved since candidate selection (webhook, dispute)
        if !statuses.iter().any(|s| *s == invoice.status) {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        // A dispute submitted since selection also puts the invoice on hold
        let pending_disputes = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM disputes
            WHERE tenant_id = $1 AND invoice_id = $2 AND status = 'pending'
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check disputes: {}", e)))?;

        if pending_disputes > 0 {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        let blocked = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM reminder_dispatches
            WHERE tenant_id = $1 AND invoice_id = $2 AND reminder_type = $3
              AND (status = 'pending' OR sent_utc > $4)
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(reminder_type)
        .bind(cooldown_cutoff)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check cooldown: {}", e)))?;

        if blocked > 0 {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        }

        let prior_sent = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM reminder_dispatches
            WHERE tenant_id = $1 AND invoice_id = $2 AND reminder_type = $3 AND status = 'sent'
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(reminder_type)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count dispatches: {}", e)))?;

        let notification = if with_notification {
            let notification_id = Uuid::new_v4();
            let record = sqlx::query_as::<_, NotificationRecord>(
                r#"
                INSERT INTO notifications (notification_id, tenant_id, invoice_id, sent_utc)
                VALUES ($1, $2, $3, $4)
                RETURNING notification_id, tenant_id, invoice_id, sent_utc, opened_utc, last_opened_utc, open_count
                "#,
            )
            .bind(notification_id)
            .bind(tenant_id)
            .bind(invoice_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to create notification: {}", e))
            })?;
            Some(record)
        } else {
            None
        };

        let dispatch_id = Uuid::new_v4();
        let result = sqlx::query_as::<_, ReminderDispatch>(
            r#"
            INSERT INTO reminder_dispatches (dispatch_id, tenant_id, invoice_id, rule_id, reminder_type, reminder_sequence, channel, status, notification_id, claimed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9)
            RETURNING dispatch_id, tenant_id, invoice_id, rule_id, reminder_type, reminder_sequence, channel, status, notification_id, claimed_utc, sent_utc
            "#,
        )
        .bind(dispatch_id)
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(rule_id)
        .bind(reminder_type)
        .bind((prior_sent + 1) as i32)
        .bind(channel)
        .bind(notification.as_ref().map(|n| n.notification_id))
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let dispatch = match result {
            Ok(dispatch) => dispatch,
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                // Another batch won the claim between our checks
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(None);
            }
            Err(e) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to insert dispatch claim: {}",
                    e
                )));
            }
        };

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(Some((dispatch, notification, invoice)))
    }

    /// Finalize a pending claim as sent and bump the invoice reminder
    /// counters. Returns None if the claim no longer exists (reaped).
    #[instrument(skip(self), fields(tenant_id = %tenant_id, dispatch_id = %dispatch_id))]
    pub async fn finalize_dispatch_sent(
        &self,
        tenant_id: Uuid,
        dispatch_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<ReminderDispatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_dispatch_sent"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let dispatch = sqlx::query_as::<_, ReminderDispatch>(
            r#"
            UPDATE reminder_dispatches
            SET status = 'sent', sent_utc = $3
            WHERE tenant_id = $1 AND dispatch_id = $2 AND status = 'pending'
            RETURNING dispatch_id, tenant_id, invoice_id, rule_id, reminder_type, reminder_sequence, channel, status, notification_id, claimed_utc, sent_utc
            "#,
        )
        .bind(tenant_id)
        .bind(dispatch_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to finalize dispatch: {}", e))
        })?;

        let Some(dispatch) = dispatch else {
            tx.rollback().await.ok();
            timer.observe_duration();
            warn!(dispatch_id = %dispatch_id, "Dispatch claim missing at finalize, likely reaped");
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE invoices
            SET last_reminder_utc = $3, reminder_count = reminder_count + 1, updated_utc = $3
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to bump reminder count: {}", e))
        })?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            dispatch_id = %dispatch_id,
            invoice_id = %invoice_id,
            sequence = dispatch.reminder_sequence,
            "Dispatch finalized as sent"
        );

        Ok(Some(dispatch))
    }

    /// Drop a pending claim after a failed send so the rule stays eligible
    /// on the next tick. The unsent notification row goes with it.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, dispatch_id = %dispatch_id))]
    pub async fn release_dispatch(
        &self,
        tenant_id: Uuid,
        dispatch_id: Uuid,
        notification_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["release_dispatch"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        sqlx::query(
            r#"
            DELETE FROM reminder_dispatches
            WHERE tenant_id = $1 AND dispatch_id = $2 AND status = 'pending'
            "#,
        )
        .bind(tenant_id)
        .bind(dispatch_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to release dispatch: {}", e))
        })?;

        if let Some(notification_id) = notification_id {
            sqlx::query(
                r#"
                DELETE FROM notifications
                WHERE tenant_id = $1 AND notification_id = $2 AND open_count = 0
                "#,
            )
            .bind(tenant_id)
            .bind(notification_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete notification: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();

        Ok(())
    }

    /// Reap pending claims left behind by a crashed batch, with their unsent
    /// notification rows. Returns how many claims were removed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn reap_stale_claims(
        &self,
        tenant_id: Uuid,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reap_stale_claims"])
            .start_timer();

        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let reaped = sqlx::query_as::<_, (Uuid, Option<Uuid>)>(
            r#"
            DELETE FROM reminder_dispatches
            WHERE tenant_id = $1 AND status = 'pending' AND claimed_utc < $2
            RETURNING dispatch_id, notification_id
            "#,
        )
        .bind(tenant_id)
        .bind(older_than)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to reap stale claims: {}", e))
        })?;

        let notification_ids: Vec<Uuid> =
            reaped.iter().filter_map(|(_, n)| *n).collect();
        if !notification_ids.is_empty() {
            sqlx::query(
                r#"
                DELETE FROM notifications
                WHERE tenant_id = $1 AND notification_id = ANY($2) AND open_count = 0
                "#,
            )
            .bind(tenant_id)
            .bind(&notification_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to delete notifications: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "Reaped stale dispatch claims");
        }

        Ok(reaped.len() as u64)
    }

    /// List the dispatch log for an invoice, newest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    pub async fn list_dispatches(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<ReminderDispatch>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_dispatches"])
            .start_timer();

        let dispatches = sqlx::query_as::<_, ReminderDispatch>(
            r#"
            SELECT dispatch_id, tenant_id, invoice_id, rule_id, reminder_type, reminder_sequence, channel, status, notification_id, claimed_utc, sent_utc
            FROM reminder_dispatches
            WHERE tenant_id = $1 AND invoice_id = $2
            ORDER BY claimed_utc DESC
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list dispatches: {}", e)))?;

        timer.observe_duration();

        Ok(dispatches)
    }

    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Open a reminder run ledger row.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn create_run(
        &self,
        tenant_id: Uuid,
        run_type: RunType,
    ) -> Result<ReminderRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_run"])
            .start_timer();

        let run_id = Uuid::new_v4();
        let run = sqlx::query_as::<_, ReminderRun>(
            r#"
            INSERT INTO reminder_runs (run_id, tenant_id, run_type)
            VALUES ($1, $2, $3)
            RETURNING run_id, tenant_id, run_type, status, started_utc, completed_utc, rules_evaluated, invoices_matched, dispatches_sent, send_failures, error_message
            "#,
        )
        .bind(run_id)
        .bind(tenant_id)
        .bind(run_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    /// Close a reminder run with its final counts.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self), fields(tenant_id = %tenant_id, run_id = %run_id))]
    pub async fn complete_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
        rules_evaluated: i32,
        invoices_matched: i32,
        dispatches_sent: i32,
        send_failures: i32,
        error_message: Option<&str>,
    ) -> Result<ReminderRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["complete_run"])
            .start_timer();

        let run = sqlx::query_as::<_, ReminderRun>(
            r#"
            UPDATE reminder_runs
            SET status = $3, completed_utc = $4, rules_evaluated = $5, invoices_matched = $6, dispatches_sent = $7, send_failures = $8, error_message = $9
            WHERE tenant_id = $1 AND run_id = $2
            RETURNING run_id, tenant_id, run_type, status, started_utc, completed_utc, rules_evaluated, invoices_matched, dispatches_sent, send_failures, error_message
            "#,
        )
        .bind(tenant_id)
        .bind(run_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(rules_evaluated)
        .bind(invoices_matched)
        .bind(dispatches_sent)
        .bind(send_failures)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to complete run: {}", e)))?;

        timer.observe_duration();

        Ok(run)
    }

    /// List reminder runs, cursor-paged.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_runs(
        &self,
        tenant_id: Uuid,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<Vec<ReminderRun>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_runs"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let runs = if let Some(cursor) = page_token {
            sqlx::query_as::<_, ReminderRun>(
                r#"
                SELECT run_id, tenant_id, run_type, status, started_utc, completed_utc, rules_evaluated, invoices_matched, dispatches_sent, send_failures, error_message
                FROM reminder_runs
                WHERE tenant_id = $1 AND run_id > $2
                ORDER BY run_id
                LIMIT $3
                "#,
            )
            .bind(tenant_id)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, ReminderRun>(
                r#"
                SELECT run_id, tenant_id, run_type, status, started_utc, completed_utc, rules_evaluated, invoices_matched, dispatches_sent, send_failures, error_message
                FROM reminder_runs
                WHERE tenant_id = $1
                ORDER BY run_id
                LIMIT $2
                "#,
            )
            .bind(tenant_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list runs: {}", e)))?;

        timer.observe_duration();

        Ok(runs)
    }

    // =========================================================================
    // Dispute Operations
    // =========================================================================

    /// Create a pending dispute. The invoice itself is not transitioned;
    /// only a `resolved_paid` resolution touches it.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, invoice_id = %input.invoice_id))]
    pub async fn create_dispute(
        &self,
        tenant_id: Uuid,
        input: &SubmitDispute,
    ) -> Result<Dispute, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_dispute"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(input.invoice_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Invoice {} not found", input.invoice_id))
        })?;

        if invoice.sent_utc.is_none() {
            tx.rollback().await.ok();
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Invoice {} has not been sent",
                input.invoice_id
            )));
        }
        if invoice.status() == InvoiceStatus::Paid {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is already paid",
                input.invoice_id
            )));
        }

        let open_disputes = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM disputes
            WHERE tenant_id = $1 AND invoice_id = $2 AND status = 'pending'
            "#,
        )
        .bind(tenant_id)
        .bind(input.invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check disputes: {}", e)))?;

        if open_disputes > 0 {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A dispute is already pending for invoice {}",
                input.invoice_id
            )));
        }

        let dispute_id = Uuid::new_v4();
        let dispute = sqlx::query_as::<_, Dispute>(
            r#"
            INSERT INTO disputes (dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, submitted_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, status, resolved_by, resolution_notes, submitted_utc, resolved_utc
            "#,
        )
        .bind(dispute_id)
        .bind(tenant_id)
        .bind(input.invoice_id)
        .bind(input.claimed_paid_on)
        .bind(&input.claimed_method)
        .bind(input.claimed_amount)
        .bind(&input.claimed_reference)
        .bind(&input.comment)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create dispute: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            dispute_id = %dispute_id,
            invoice_id = %input.invoice_id,
            "Dispute created"
        );

        Ok(dispute)
    }

    /// Get a dispute by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, dispute_id = %dispute_id))]
    pub async fn get_dispute(
        &self,
        tenant_id: Uuid,
        dispute_id: Uuid,
    ) -> Result<Option<Dispute>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_dispute"])
            .start_timer();

        let dispute = sqlx::query_as::<_, Dispute>(
            r#"
            SELECT dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, status, resolved_by, resolution_notes, submitted_utc, resolved_utc
            FROM disputes
            WHERE tenant_id = $1 AND dispute_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(dispute_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get dispute: {}", e)))?;

        timer.observe_duration();

        Ok(dispute)
    }

    /// List disputes with an optional status filter, cursor-paged.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_disputes(
        &self,
        tenant_id: Uuid,
        status: Option<&str>,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<Vec<Dispute>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_disputes"])
            .start_timer();

        let limit = page_size.clamp(1, 100) as i64;

        let disputes = if let Some(cursor) = page_token {
            sqlx::query_as::<_, Dispute>(
                r#"
                SELECT dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, status, resolved_by, resolution_notes, submitted_utc, resolved_utc
                FROM disputes
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR status = $2)
                  AND dispute_id > $3
                ORDER BY dispute_id
                LIMIT $4
                "#,
            )
            .bind(tenant_id)
            .bind(status)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Dispute>(
                r#"
                SELECT dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, status, resolved_by, resolution_notes, submitted_utc, resolved_utc
                FROM disputes
                WHERE tenant_id = $1
                  AND ($2::varchar IS NULL OR status = $2)
                ORDER BY dispute_id
                LIMIT $3
                "#,
            )
            .bind(tenant_id)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list disputes: {}", e)))?;

        timer.observe_duration();

        Ok(disputes)
    }

    /// Resolve a pending dispute. `resolved_paid` applies the claimed amount
    /// (or the full remaining balance when no amount was claimed) through the
    /// same payment-application path the gateway uses; the other verdicts
    /// leave the invoice untouched. The third element is the amount actually
    /// applied after capping, zero for non-paid verdicts.
    #[instrument(skip(self, notes), fields(tenant_id = %tenant_id, dispute_id = %dispute_id))]
    pub async fn resolve_dispute(
        &self,
        tenant_id: Uuid,
        dispute_id: Uuid,
        resolution: DisputeResolution,
        notes: Option<&str>,
        resolved_by: &str,
    ) -> Result<(Dispute, Invoice, Decimal), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_dispute"])
            .start_timer();

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;

        let dispute = sqlx::query_as::<_, Dispute>(
            r#"
            SELECT dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, status, resolved_by, resolution_notes, submitted_utc, resolved_utc
            FROM disputes
            WHERE tenant_id = $1 AND dispute_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(dispute_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock dispute: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Dispute {} not found", dispute_id)))?;

        if dispute.status != "pending" {
            tx.rollback().await.ok();
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Dispute {} is already resolved",
                dispute_id
            )));
        }

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            SELECT invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
            FROM invoices
            WHERE tenant_id = $1 AND invoice_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(dispute.invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock invoice: {}", e)))?;

        let paid_before = invoice.amount_paid;
        let invoice = match resolution {
            DisputeResolution::ResolvedPaid => {
                let amount = dispute.claimed_amount.unwrap_or(invoice.amount_due());
                sqlx::query_as::<_, Invoice>(
                    r#"
                    UPDATE invoices
                    SET amount_paid = LEAST(total_amount, amount_paid + $3),
                        status = CASE WHEN amount_paid + $3 >= total_amount THEN 'paid' ELSE 'partial_paid' END,
                        updated_utc = $4
                    WHERE tenant_id = $1 AND invoice_id = $2
                    RETURNING invoice_id, tenant_id, client_id, client_email, total_amount, currency, status, amount_paid, payment_method, method_selected_utc, sent_utc, last_reminder_utc, reminder_count, created_utc, updated_utc
                    "#,
                )
                .bind(tenant_id)
                .bind(dispute.invoice_id)
                .bind(amount)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to apply payment: {}", e))
                })?
            }
            DisputeResolution::ResolvedUnpaid | DisputeResolution::Invalid => invoice,
        };
        let applied = invoice.amount_paid - paid_before;

        let dispute = sqlx::query_as::<_, Dispute>(
            r#"
            UPDATE disputes
            SET status = $3, resolved_by = $4, resolution_notes = $5, resolved_utc = $6
            WHERE tenant_id = $1 AND dispute_id = $2
            RETURNING dispute_id, tenant_id, invoice_id, claimed_paid_on, claimed_method, claimed_amount, claimed_reference, comment, status, resolved_by, resolution_notes, submitted_utc, resolved_utc
            "#,
        )
        .bind(tenant_id)
        .bind(dispute_id)
        .bind(resolution.status().as_str())
        .bind(resolved_by)
        .bind(notes)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to resolve dispute: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })?;

        timer.observe_duration();
        info!(
            dispute_id = %dispute_id,
            resolution = %dispute.status,
            invoice_status = %invoice.status,
            amount_applied = %applied,
            "Dispute resolved"
        );

        Ok((dispute, invoice, applied))
    }
}
