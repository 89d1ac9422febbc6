//! Payment records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub invoice_id: Uuid,
    pub payment_number: String,
    pub reference_number: String,
    pub amount: f64,
    pub payment_method: String,
    pub payment_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

pub(crate) const PAYMENT_COLUMNS: &str = "id, branch_id, invoice_id, payment_number, \
     reference_number, amount, payment_method, payment_date, created_at";

/// Reference number recorded for a payment that arrived through the webhook.
pub fn webhook_reference(event_id: &str) -> String {
    format!("WEBHOOK-{}", event_id)
}
