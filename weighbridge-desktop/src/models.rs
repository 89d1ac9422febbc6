//! Client-side views of server resources and queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /api/transactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionPayload {
    pub client_id: Uuid,
    pub vehicle_id: Uuid,
    pub transaction_type: String,
    pub first_weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Body of `POST /api/transactions/:id/complete`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub second_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTransaction {
    pub id: Uuid,
    pub transaction_number: String,
    pub status: String,
    pub first_weight: f64,
    pub second_weight: Option<f64>,
    pub net_weight: Option<f64>,
    #[serde(default)]
    pub client_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInvoice {
    pub id: Uuid,
    pub invoice_number: String,
    pub total_amount: f64,
    pub balance: f64,
    pub status: String,
}

/// Server answer to a completion. Pricing is not kept client-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub transaction: RemoteTransaction,
    pub invoice: RemoteInvoice,
}

/// How a queued completion or the active pointer names its transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransactionRef {
    /// Confirmed by the server.
    Server { id: Uuid },
    /// Still a queued create, known only by its idempotency key.
    PendingCreate { idempotency_key: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuedWrite {
    CreateTx {
        payload: CreateTransactionPayload,
    },
    CompleteTx {
        target: TransactionRef,
        payload: CompletePayload,
    },
}

impl QueuedWrite {
    pub fn kind(&self) -> &'static str {
        match self {
            QueuedWrite::CreateTx { .. } => "CREATE_TX",
            QueuedWrite::CompleteTx { .. } => "COMPLETE_TX",
        }
    }
}

/// One not-yet-acknowledged write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub idempotency_key: String,
    pub write: QueuedWrite,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

/// What the station shows next to the "sync now" button.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub pending: i64,
    /// Writes the server refused; they wait for the operator and are never resent.
    pub rejected: i64,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}
