//! Request and response bodies for the REST API.

use crate::models::{DailyTotals, Invoice, InvoiceLineItem, Payment, Transaction};
use crate::services::pricing::PricingResult;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateTransactionRequest {
    pub client_id: Uuid,
    pub vehicle_id: Uuid,
    pub operator_id: Option<Uuid>,
    #[validate(length(min = 1, message = "transaction_type is required"))]
    pub transaction_type: String,
    #[validate(range(min = 0.0, message = "first_weight must not be negative"))]
    pub first_weight: f64,
    #[validate(length(max = 128, message = "material_type is too long"))]
    pub material_type: Option<String>,
    #[validate(length(max = 128, message = "reference_number is too long"))]
    pub reference_number: Option<String>,
    #[validate(length(max = 2000, message = "notes are too long"))]
    pub notes: Option<String>,
    /// Body fallback for the `Idempotency-Key` header.
    pub idempotency_key: Option<String>,
    /// Older clients send the key under this name.
    pub client_request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CompleteTransactionRequest {
    #[validate(range(min = 0.0, message = "second_weight must not be negative"))]
    pub second_weight: f64,
    pub idempotency_key: Option<String>,
}

/// Result of completing a transaction. `pricing` is `None` on a replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub transaction: Transaction,
    pub invoice: Invoice,
    pub pricing: Option<PricingResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTransactionsQuery {
    pub status: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl ListTransactionsQuery {
    /// 1-based page and clamped page size.
    pub fn paging(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self.per_page.unwrap_or(20).clamp(1, MAX_PER_PAGE);
        (page, per_page)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPage {
    pub items: Vec<Transaction>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceDetail {
    pub invoice: Invoice,
    pub line_items: Vec<InvoiceLineItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentWebhookEvent {
    pub event_id: String,
    pub event_type: Option<String>,
    pub branch_id: Uuid,
    pub data: PaymentWebhookData,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentWebhookData {
    pub invoice_id: Uuid,
    pub payment_amount: f64,
    pub payment_method: Option<String>,
    pub payment_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookOutcome {
    /// False for replays and for ignored event types.
    pub applied: bool,
    pub payment: Option<Payment>,
    pub invoice: Option<Invoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DailyReportQuery {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub branch_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub days: Vec<DailyTotals>,
}
