//! Letter sender capability. The engine decides *whether* a letter goes out;
//! the letter system owns the content, so this boundary only carries the
//! template name and the invoice context it needs.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("Letter sender is not enabled")]
    NotEnabled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),
}

impl From<SenderError> for service_core::error::AppError {
    fn from(e: SenderError) -> Self {
        service_core::error::AppError::SendError(e.to_string())
    }
}

/// One outbound letter request.
#[derive(Debug, Clone, Serialize)]
pub struct LetterRequest {
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    /// Tracking pixel id the letter must embed; absent for staff alerts.
    pub notification_id: Option<Uuid>,
    pub recipient: String,
    pub template: String,
    pub amount_due: Decimal,
    pub currency: String,
}

/// What the letter system acknowledged.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub letter_id: Option<String>,
}

#[async_trait]
pub trait LetterSender: Send + Sync {
    async fn send(&self, letter: &LetterRequest) -> Result<SendReceipt, SenderError>;
    async fn health_check(&self) -> Result<(), SenderError>;
    fn is_enabled(&self) -> bool;
}

/// Posts letter requests to the letter system's HTTP API.
pub struct HttpLetterSender {
    base_url: String,
    api_token: Secret<String>,
    enabled: bool,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LetterApiResponse {
    letter_id: Option<String>,
}

impl HttpLetterSender {
    pub fn new(base_url: String, api_token: Secret<String>, enabled: bool) -> Self {
        Self {
            base_url,
            api_token,
            enabled,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LetterSender for HttpLetterSender {
    async fn send(&self, letter: &LetterRequest) -> Result<SendReceipt, SenderError> {
        if !self.enabled {
            return Err(SenderError::NotEnabled);
        }

        if self.base_url.is_empty() {
            return Err(SenderError::Configuration(
                "Letter API base URL is not configured".to_string(),
            ));
        }

        let url = format!("{}/letters", self.base_url);

        let response = self
            .client
            .traced_post(&url)
            .bearer_auth(self.api_token.expose_secret())
            .json(letter)
            .send()
            .await
            .map_err(|e| {
                SenderError::Connection(format!("Failed to reach letter API: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SenderError::SendFailed(format!(
                "Letter API returned status {}: {}",
                status, body
            )));
        }

        let api_response: LetterApiResponse = response.json().await.map_err(|e| {
            SenderError::SendFailed(format!("Failed to parse letter API response: {}", e))
        })?;

        tracing::info!(
            invoice_id = %letter.invoice_id,
            recipient = %letter.recipient,
            template = %letter.template,
            "Letter request accepted"
        );

        Ok(SendReceipt {
            letter_id: api_response.letter_id,
        })
    }

    async fn health_check(&self) -> Result<(), SenderError> {
        if !self.enabled {
            return Ok(());
        }

        if self.base_url.is_empty() {
            return Err(SenderError::Configuration(
                "Letter API base URL is not configured".to_string(),
            ));
        }

        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Mock letter sender for testing. Records every request and can be toggled
/// to fail, for exercising the release-on-failure path.
pub struct MockLetterSender {
    send_count: AtomicU64,
    failing: AtomicBool,
    sent: Mutex<Vec<LetterRequest>>,
}

impl Default for MockLetterSender {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLetterSender {
    pub fn new() -> Self {
        Self {
            send_count: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent_requests(&self) -> Vec<LetterRequest> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LetterSender for MockLetterSender {
    async fn send(&self, letter: &LetterRequest) -> Result<SendReceipt, SenderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SenderError::SendFailed(
                "Mock letter sender is set to fail".to_string(),
            ));
        }

        let count = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(letter.clone());
        }

        tracing::info!(
            invoice_id = %letter.invoice_id,
            recipient = %letter.recipient,
            template = %letter.template,
            "[MOCK] Letter would be sent"
        );

        Ok(SendReceipt {
            letter_id: Some(format!("mock-letter-{}", count)),
        })
    }

    async fn health_check(&self) -> Result<(), SenderError> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }
}
