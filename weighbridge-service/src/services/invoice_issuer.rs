//! Invoice issuing for completed transactions.
//!
//! A transaction gets at most one invoice (`uq_invoices_transaction`) and an invoice at
//! most one line item (`uq_line_items_invoice`). Number collisions are retried; a
//! collision on the transaction itself means a concurrent writer won and its invoice is
//! returned instead.

use crate::models::invoice::{balance_of, INVOICE_COLUMNS};
use crate::models::{Invoice, InvoiceStatus, Transaction};
use crate::services::database::{db_error, fetch_branch, invoice_for_transaction, is_unique_violation};
use crate::services::metrics::{DB_QUERY_DURATION, INVOICES_ISSUED};
use crate::services::numbering::{generate_invoice_number, INVOICE_NUMBER_ATTEMPTS};
use crate::services::pricing::PricingResult;
use chrono::{Duration, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::{Connection, PgConnection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const DUE_AFTER_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct IssuedInvoice {
    pub invoice: Invoice,
    /// False when an existing invoice was returned.
    pub created: bool,
}

/// Amounts for a new invoice. Tax is a percentage of the subtotal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvoiceAmounts {
    pub subtotal: f64,
    pub tax_amount: f64,
    pub total_amount: f64,
}

impl InvoiceAmounts {
    pub fn new(subtotal: f64, tax_rate: f64) -> Self {
        let tax_amount = subtotal * tax_rate / 100.0;
        Self {
            subtotal,
            tax_amount,
            total_amount: subtotal + tax_amount,
        }
    }

    /// Status of a fresh invoice with nothing paid. A zero total is settled on issue.
    pub fn initial_status(&self, issue_date: NaiveDate) -> InvoiceStatus {
        let balance = balance_of(self.total_amount, 0.0);
        InvoiceStatus::derive(0.0, balance, due_date(issue_date), issue_date)
    }
}

pub fn due_date(issue_date: NaiveDate) -> NaiveDate {
    issue_date + Duration::days(DUE_AFTER_DAYS)
}

pub fn line_item_description(transaction: &Transaction) -> String {
    format!(
        "Weighing {} ({}): first {:.2} kg, second {:.2} kg, net {:.2} kg",
        transaction.transaction_number,
        transaction.transaction_type,
        transaction.first_weight,
        transaction.second_weight.unwrap_or_default(),
        transaction.net_weight.unwrap_or_default()
    )
}

/// Return the invoice for `transaction`, creating it on the caller's database
/// transaction if none exists yet.
#[instrument(skip(conn, transaction, pricing), fields(transaction_id = %transaction.id))]
pub async fn issue_for(
    conn: &mut PgConnection,
    transaction: &Transaction,
    pricing: &PricingResult,
) -> Result<IssuedInvoice, AppError> {
    if let Some(existing) =
        invoice_for_transaction(conn, transaction.branch_id, transaction.id).await?
    {
        ensure_line_item(conn, &existing, transaction).await?;
        INVOICES_ISSUED.with_label_values(&["existing"]).inc();
        return Ok(IssuedInvoice {
            invoice: existing,
            created: false,
        });
    }

    let branch = fetch_branch(conn, transaction.branch_id).await?;
    let amounts = InvoiceAmounts::new(pricing.subtotal, branch.tax_rate);
    let issue_date = Utc::now().date_naive();

    for attempt in 1..=INVOICE_NUMBER_ATTEMPTS {
        let number = generate_invoice_number(&branch.code, issue_date);

        let mut savepoint = conn
            .begin()
            .await
            .map_err(|e| db_error("open savepoint", e))?;
        let inserted = insert_invoice(
            &mut savepoint,
            transaction,
            &number,
            issue_date,
            amounts,
            &branch.payment_terms,
            &pricing.breakdown,
        )
        .await;

        match inserted {
            Ok(invoice) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| db_error("release savepoint", e))?;
                ensure_line_item(conn, &invoice, transaction).await?;

                INVOICES_ISSUED.with_label_values(&["created"]).inc();
                info!(
                    invoice_id = %invoice.id,
                    invoice_number = %invoice.invoice_number,
                    total_amount = invoice.total_amount,
                    "Invoice issued"
                );
                return Ok(IssuedInvoice {
                    invoice,
                    created: true,
                });
            }
            Err(e) if is_unique_violation(&e, None) => {
                savepoint.rollback().await.ok();

                if let Some(winner) =
                    invoice_for_transaction(conn, transaction.branch_id, transaction.id).await?
                {
                    ensure_line_item(conn, &winner, transaction).await?;
                    INVOICES_ISSUED.with_label_values(&["joined"]).inc();
                    info!(invoice_id = %winner.id, "Joined concurrently issued invoice");
                    return Ok(IssuedInvoice {
                        invoice: winner,
                        created: false,
                    });
                }
                warn!(attempt, number = %number, "Invoice number collision, regenerating");
            }
            Err(e) => return Err(db_error("insert invoice", e)),
        }
    }

    Err(AppError::Conflict(anyhow::anyhow!(
        "Could not allocate a unique invoice number after {} attempts",
        INVOICE_NUMBER_ATTEMPTS
    )))
}

async fn insert_invoice(
    conn: &mut PgConnection,
    transaction: &Transaction,
    number: &str,
    issue_date: NaiveDate,
    amounts: InvoiceAmounts,
    payment_terms: &str,
    breakdown: &str,
) -> Result<Invoice, sqlx::Error> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_invoice"])
        .start_timer();

    let invoice = sqlx::query_as::<_, Invoice>(&format!(
        r#"
        INSERT INTO invoices (
            id, branch_id, client_id, transaction_id, invoice_number, issue_date, due_date,
            subtotal, tax_amount, total_amount, paid_amount, balance, status,
            payment_terms, pricing_breakdown
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11, $12, $13, $14)
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(transaction.branch_id)
    .bind(transaction.client_id)
    .bind(transaction.id)
    .bind(number)
    .bind(issue_date)
    .bind(due_date(issue_date))
    .bind(amounts.subtotal)
    .bind(amounts.tax_amount)
    .bind(amounts.total_amount)
    .bind(balance_of(amounts.total_amount, 0.0))
    .bind(amounts.initial_status(issue_date).as_str())
    .bind(payment_terms)
    .bind(breakdown)
    .fetch_one(&mut *conn)
    .await;

    timer.observe_duration();
    invoice
}

/// Insert the single line item unless one already exists.
async fn ensure_line_item(
    conn: &mut PgConnection,
    invoice: &Invoice,
    transaction: &Transaction,
) -> Result<(), AppError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM invoice_line_items WHERE invoice_id = $1)",
    )
    .bind(invoice.id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("check line item", e))?;

    if exists {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO invoice_line_items (id, invoice_id, description, quantity, unit_price, amount)
        VALUES ($1, $2, $3, 1, $4, $4)
        ON CONFLICT (invoice_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(invoice.id)
    .bind(line_item_description(transaction))
    .bind(invoice.subtotal)
    .execute(&mut *conn)
    .await
    .map_err(|e| db_error("insert line item", e))?;

    Ok(())
}
