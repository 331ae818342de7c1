//! Outbound letter record with open tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One outbound communication tied to an invoice. Created at send time;
/// mutated only by open-tracking increments. `opened_utc` holds the first
/// open, `open_count` grows monotonically.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationRecord {
    pub notification_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub sent_utc: DateTime<Utc>,
    pub opened_utc: Option<DateTime<Utc>>,
    pub last_opened_utc: Option<DateTime<Utc>>,
    pub open_count: i32,
}
