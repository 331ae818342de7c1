//! Application startup and lifecycle management.

use crate::config::CollectionsConfig;
use crate::handlers;
use crate::services::{
    init_metrics, Database, Dispatcher, HttpLetterSender, LetterSender, LifecycleService,
    MockLetterSender, Reconciler, RuleEngine, Scheduler,
};
use axum::middleware::from_fn;
use axum::routing::{get, post, put};
use axum::Router;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: CollectionsConfig,
    pub db: Arc<Database>,
    pub sender: Arc<dyn LetterSender>,
    pub lifecycle: LifecycleService,
    pub reconciler: Arc<Reconciler>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CollectionsConfig) -> Result<Self, AppError> {
        Self::build_internal(config, None, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: CollectionsConfig) -> Result<Self, AppError> {
        Self::build_internal(config, None, false).await
    }

    /// Build with a caller-supplied letter sender instead of the one the
    /// configuration would pick. Tests pass a [`MockLetterSender`] here and
    /// inspect what the dispatcher handed it. Skips migrations.
    pub async fn build_with_sender(
        config: CollectionsConfig,
        sender: Arc<dyn LetterSender>,
    ) -> Result<Self, AppError> {
        Self::build_internal(config, Some(sender), false).await
    }

    async fn build_internal(
        config: CollectionsConfig,
        sender_override: Option<Arc<dyn LetterSender>>,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let db = Arc::new(db);

        let sender: Arc<dyn LetterSender> = match sender_override {
            Some(sender) => sender,
            None if config.letter.enabled => {
                tracing::info!(api_url = %config.letter.api_url, "Letter delivery enabled");
                Arc::new(HttpLetterSender::new(
                    config.letter.api_url.clone(),
                    config.letter.api_token.clone(),
                    true,
                ))
            }
            None => {
                tracing::info!("Letter delivery disabled, using mock sender");
                Arc::new(MockLetterSender::new())
            }
        };

        let lifecycle = LifecycleService::new(db.clone());
        let reconciler = Arc::new(Reconciler::new(db.clone(), lifecycle.clone()));
        let engine = RuleEngine::new(
            db.clone(),
            config.reminder.default_cooldown_days,
            config.reminder.batch_limit,
        );
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            engine,
            sender.clone(),
            config.scheduler.stale_claim_minutes,
        ));

        let state = AppState {
            config: config.clone(),
            db,
            sender,
            lifecycle,
            reconciler,
            dispatcher,
        };

        // Bind HTTP listener (port 0 lets tests grab a random free port)
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Collections service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until the server future completes. The reminder
    /// scheduler runs alongside the server and is stopped between ticks when
    /// the server exits.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = Scheduler::new(
            self.state.dispatcher.clone(),
            self.state.config.scheduler.tick_interval_secs,
        );
        let shutdown_token = scheduler.shutdown_token();
        let scheduler_task = tokio::spawn(scheduler.start());

        let router = build_router(self.state);
        let result = axum::serve(self.http_listener, router).await;

        shutdown_token.cancel();
        let _ = scheduler_task.await;

        result
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        // Processor-facing webhook, authenticated by HMAC signature
        .route(
            "/webhooks/processor",
            post(handlers::webhook::processor_webhook),
        )
        // Capability links embedded in outbound letters (no tenant header)
        .route("/t/open/:notification_id", get(handlers::tracking::open_pixel))
        .route("/t/select/:invoice_id", post(handlers::tracking::select_method))
        .route(
            "/t/payment-started/:invoice_id",
            post(handlers::tracking::payment_started),
        )
        .route(
            "/disputes",
            post(handlers::disputes::submit_dispute).get(handlers::disputes::list_disputes),
        )
        .route(
            "/disputes/:dispute_id/resolve",
            post(handlers::disputes::resolve_dispute),
        )
        // Staff endpoints (tenant-scoped via X-Tenant-ID)
        .route(
            "/invoices",
            post(handlers::invoices::create_invoice).get(handlers::invoices::list_invoices),
        )
        .route("/invoices/:invoice_id", get(handlers::invoices::get_invoice))
        .route(
            "/invoices/:invoice_id/sent",
            post(handlers::invoices::record_sent),
        )
        .route(
            "/rules",
            get(handlers::rules::list_rules).post(handlers::rules::create_rule),
        )
        .route(
            "/rules/seed-defaults",
            post(handlers::rules::seed_default_rules),
        )
        .route("/rules/:rule_id", put(handlers::rules::update_rule))
        .route("/rules/:rule_id/disable", post(handlers::rules::disable_rule))
        .route(
            "/gateway-accounts",
            post(handlers::admin::create_gateway_account),
        )
        .route("/webhook-audit", get(handlers::admin::list_webhook_audit))
        .route(
            "/internal/run-reminders",
            post(handlers::admin::run_reminders),
        )
        .route("/runs", get(handlers::admin::list_runs))
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .with_state(state)
}
