//! Payment webhook application.
//!
//! A delivery is identified by its `event_id`, stored as the payment's reference number
//! (`WEBHOOK-<event_id>`). The unique `(branch_id, reference_number)` constraint is the
//! backstop for concurrent redeliveries.

use crate::dtos::{PaymentWebhookEvent, WebhookOutcome};
use crate::models::invoice::INVOICE_COLUMNS;
use crate::models::payment::PAYMENT_COLUMNS;
use crate::models::{balance_of, webhook_reference, Invoice, InvoiceStatus, Payment};
use crate::services::database::{db_error, fetch_branch, is_unique_violation, Database};
use crate::services::metrics::{DB_QUERY_DURATION, IDEMPOTENT_REPLAYS, PAYMENTS_APPLIED};
use crate::services::numbering::{next_payment_sequence, payment_number};
use chrono::{Datelike, Utc};
use service_core::error::AppError;
use sqlx::{Connection, PgConnection};
use tracing::{info, instrument};
use uuid::Uuid;

pub const INVOICE_PAID_EVENT: &str = "invoice.paid";
pub const DEFAULT_PAYMENT_METHOD: &str = "online";

const REFERENCE_CONSTRAINT: &str = "uq_payments_reference";

/// Only `invoice.paid` (or an untyped event) moves money.
pub fn is_applicable(event_type: Option<&str>) -> bool {
    event_type.map_or(true, |t| t.trim() == INVOICE_PAID_EVENT)
}

/// Invoice amounts after applying `amount`.
pub fn settle(invoice: &Invoice, amount: f64, today: chrono::NaiveDate) -> (f64, f64, InvoiceStatus) {
    let paid = invoice.paid_amount + amount;
    let balance = balance_of(invoice.total_amount, paid);
    let status = InvoiceStatus::derive(paid, balance, invoice.due_date, today);
    (paid, balance, status)
}

#[instrument(skip(db, event), fields(event_id = %event.event_id, branch_id = %event.branch_id))]
pub async fn apply_invoice_paid(
    db: &Database,
    event: &PaymentWebhookEvent,
) -> Result<WebhookOutcome, AppError> {
    if !is_applicable(event.event_type.as_deref()) {
        PAYMENTS_APPLIED.with_label_values(&["ignored"]).inc();
        info!(event_type = ?event.event_type, "Ignoring webhook event type");
        return Ok(WebhookOutcome {
            applied: false,
            payment: None,
            invoice: None,
        });
    }

    let event_id = event.event_id.trim();
    if event_id.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!("event_id is required")));
    }
    let amount = event.data.payment_amount;
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "payment_amount must be greater than zero"
        )));
    }

    let branch_id = event.branch_id;
    let reference = webhook_reference(event_id);

    let mut tx = db
        .pool()
        .begin()
        .await
        .map_err(|e| db_error("begin transaction", e))?;

    if let Some(existing) = payment_by_reference(&mut tx, branch_id, &reference).await? {
        let outcome = replay(&mut tx, existing).await;
        tx.rollback().await.ok();
        return outcome;
    }

    let invoice = lock_invoice(&mut tx, branch_id, event.data.invoice_id).await?;
    if invoice.parsed_status() == Some(InvoiceStatus::Cancelled) {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Invoice {} is cancelled",
            invoice.invoice_number
        )));
    }

    let today = Utc::now().date_naive();
    let payment_date = event.data.payment_date.unwrap_or(today);
    let branch = fetch_branch(&mut tx, branch_id).await?;
    let sequence = next_payment_sequence(&mut tx, branch_id, payment_date).await?;
    let number = payment_number(&branch.code, payment_date.year(), sequence);
    let method = event
        .data
        .payment_method
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_PAYMENT_METHOD);

    let mut savepoint = (*tx)
        .begin()
        .await
        .map_err(|e| db_error("open savepoint", e))?;
    let inserted = sqlx::query_as::<_, Payment>(&format!(
        r#"
        INSERT INTO payments (id, branch_id, invoice_id, payment_number, reference_number, amount, payment_method, payment_date)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        PAYMENT_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(branch_id)
    .bind(invoice.id)
    .bind(&number)
    .bind(&reference)
    .bind(amount)
    .bind(method)
    .bind(payment_date)
    .fetch_one(&mut *savepoint)
    .await;

    let payment = match inserted {
        Ok(payment) => {
            savepoint
                .commit()
                .await
                .map_err(|e| db_error("release savepoint", e))?;
            payment
        }
        Err(e) if is_unique_violation(&e, Some(REFERENCE_CONSTRAINT)) => {
            savepoint.rollback().await.ok();
            let winner = payment_by_reference(&mut tx, branch_id, &reference)
                .await?
                .ok_or_else(|| {
                    AppError::Conflict(anyhow::anyhow!(
                        "Payment reference {} was claimed by a request that did not commit",
                        reference
                    ))
                })?;
            let outcome = replay(&mut tx, winner).await;
            // Discards the counter bump along with everything else.
            tx.rollback().await.ok();
            return outcome;
        }
        Err(e) => return Err(db_error("insert payment", e)),
    };

    let (paid, balance, status) = settle(&invoice, amount, today);

    let timer = DB_QUERY_DURATION
        .with_label_values(&["apply_payment"])
        .start_timer();
    let updated = sqlx::query_as::<_, Invoice>(&format!(
        r#"
        UPDATE invoices
        SET paid_amount = $3, balance = $4, status = $5, updated_at = NOW()
        WHERE branch_id = $1 AND id = $2
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    ))
    .bind(branch_id)
    .bind(invoice.id)
    .bind(paid)
    .bind(balance)
    .bind(status.as_str())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| db_error("update invoice balance", e))?;
    timer.observe_duration();

    tx.commit()
        .await
        .map_err(|e| db_error("commit transaction", e))?;

    PAYMENTS_APPLIED.with_label_values(&["applied"]).inc();
    info!(
        payment_number = %payment.payment_number,
        invoice_id = %updated.id,
        balance = updated.balance,
        status = %updated.status,
        "Payment applied"
    );

    Ok(WebhookOutcome {
        applied: true,
        payment: Some(payment),
        invoice: Some(updated),
    })
}

async fn replay(conn: &mut PgConnection, payment: Payment) -> Result<WebhookOutcome, AppError> {
    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {} FROM invoices WHERE branch_id = $1 AND id = $2",
        INVOICE_COLUMNS
    ))
    .bind(payment.branch_id)
    .bind(payment.invoice_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("get invoice", e))?;

    PAYMENTS_APPLIED.with_label_values(&["replayed"]).inc();
    IDEMPOTENT_REPLAYS.with_label_values(&["payment_webhook"]).inc();
    info!(payment_number = %payment.payment_number, "Webhook delivery already applied");

    Ok(WebhookOutcome {
        applied: false,
        payment: Some(payment),
        invoice,
    })
}

async fn payment_by_reference(
    conn: &mut PgConnection,
    branch_id: Uuid,
    reference: &str,
) -> Result<Option<Payment>, AppError> {
    sqlx::query_as::<_, Payment>(&format!(
        "SELECT {} FROM payments WHERE branch_id = $1 AND reference_number = $2",
        PAYMENT_COLUMNS
    ))
    .bind(branch_id)
    .bind(reference)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("find payment by reference", e))
}

async fn lock_invoice(
    conn: &mut PgConnection,
    branch_id: Uuid,
    invoice_id: Uuid,
) -> Result<Invoice, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {} FROM invoices WHERE branch_id = $1 AND id = $2 FOR UPDATE",
        INVOICE_COLUMNS
    ))
    .bind(branch_id)
    .bind(invoice_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("lock invoice", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))
}
