//! Periodic reminder scheduler.
//!
//! Drives the dispatcher on a fixed interval. Each tick evaluates every
//! tenant's active rules and sends whatever reminders are due. An interval
//! of zero disables the loop entirely, which is how tests and manual-only
//! deployments run.

use crate::services::Dispatcher;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    tick_interval: Duration,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<Dispatcher>, tick_interval_secs: u64) -> Self {
        Self {
            dispatcher,
            tick_interval: Duration::from_secs(tick_interval_secs),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Token the server holds to stop the loop during graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Run the tick loop until the shutdown token is cancelled.
    ///
    /// The first tick fires one full interval after startup, not
    /// immediately, so a restart never doubles up with the previous
    /// process's last run.
    pub async fn start(self) {
        if self.tick_interval.is_zero() {
            info!("Reminder scheduler disabled by configuration");
            return;
        }

        info!(
            interval_secs = self.tick_interval.as_secs(),
            "Starting reminder scheduler"
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval() yields its first tick immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("Reminder scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.dispatcher.run_tick(Utc::now()).await;
                }
            }
        }
    }
}
