//! Weighing transaction model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Direction of the load across the scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Inbound,
    Outbound,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a weighing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Still waiting for the second weight.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row of `transactions`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub client_id: Uuid,
    pub vehicle_id: Uuid,
    pub operator_id: Uuid,
    pub transaction_number: String,
    pub transaction_type: String,
    pub status: String,
    pub first_weight: f64,
    pub second_weight: Option<f64>,
    pub net_weight: Option<f64>,
    pub first_weight_time: DateTime<Utc>,
    pub second_weight_time: Option<DateTime<Utc>>,
    pub material_type: Option<String>,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub client_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn parsed_status(&self) -> Option<TransactionStatus> {
        TransactionStatus::parse(&self.status)
    }
}

/// Validated input for inserting a new pending transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub branch_id: Uuid,
    pub client_id: Uuid,
    pub vehicle_id: Uuid,
    pub operator_id: Uuid,
    pub transaction_type: TransactionType,
    pub first_weight: f64,
    pub material_type: Option<String>,
    pub reference_number: Option<String>,
    pub notes: Option<String>,
    pub idempotency_key: String,
}

pub(crate) const TRANSACTION_COLUMNS: &str = "id, branch_id, client_id, vehicle_id, operator_id, \
     transaction_number, transaction_type, status, first_weight, second_weight, net_weight, \
     first_weight_time, second_weight_time, material_type, reference_number, notes, \
     client_request_id, created_at, updated_at";
