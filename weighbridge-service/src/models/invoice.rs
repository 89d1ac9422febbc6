//! Invoice and line item models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Balance at or below this is treated as settled.
const SETTLED_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "sent" => Some(Self::Sent),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Status implied by the amounts and due date of a non-cancelled invoice.
    pub fn derive(paid_amount: f64, balance: f64, due_date: NaiveDate, today: NaiveDate) -> Self {
        if balance <= SETTLED_EPSILON {
            Self::Paid
        } else if paid_amount > 0.0 {
            Self::Partial
        } else if due_date < today {
            Self::Overdue
        } else {
            Self::Sent
        }
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outstanding amount, never negative.
pub fn balance_of(total_amount: f64, paid_amount: f64) -> f64 {
    (total_amount - paid_amount).max(0.0)
}

/// A row of `invoices`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub client_id: Uuid,
    pub transaction_id: Uuid,
    pub invoice_number: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
    pub paid_amount: f64,
    pub balance: f64,
    pub status: String,
    pub payment_terms: String,
    pub pricing_breakdown: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn parsed_status(&self) -> Option<InvoiceStatus> {
        InvoiceStatus::parse(&self.status)
    }
}

/// A row of `invoice_line_items`. Never updated after insert.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

pub(crate) const INVOICE_COLUMNS: &str = "id, branch_id, client_id, transaction_id, invoice_number, \
     issue_date, due_date, subtotal, tax_amount, total_amount, paid_amount, balance, status, \
     payment_terms, pricing_breakdown, created_at, updated_at";
