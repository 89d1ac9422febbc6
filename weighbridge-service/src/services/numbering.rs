//! Human-readable document numbers.
//!
//! Transaction and invoice numbers carry a random suffix and rely on a unique
//! constraint plus retry. Payment numbers come from a per-branch, per-year counter
//! bumped by a single upsert so the sequence never skips or repeats.

use crate::services::database::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{Datelike, NaiveDate};
use rand::{distributions::Alphanumeric, Rng};
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

pub const TRANSACTION_NUMBER_ATTEMPTS: usize = 3;
pub const INVOICE_NUMBER_ATTEMPTS: usize = 5;

const TRANSACTION_SUFFIX_LEN: usize = 5;
const INVOICE_SUFFIX_LEN: usize = 6;

/// Uppercase alphanumeric suffix.
pub fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect()
}

/// `<CODE>-<YYYYMMDD>-<suffix>`
pub fn transaction_number(branch_code: &str, date: NaiveDate, suffix: &str) -> String {
    format!("{}-{}-{}", branch_code, date.format("%Y%m%d"), suffix)
}

pub fn generate_transaction_number(branch_code: &str, date: NaiveDate) -> String {
    transaction_number(branch_code, date, &random_suffix(TRANSACTION_SUFFIX_LEN))
}

/// `INV-<CODE>-<YYYYMM>-<suffix>`
pub fn invoice_number(branch_code: &str, date: NaiveDate, suffix: &str) -> String {
    format!("INV-{}-{}-{}", branch_code, date.format("%Y%m"), suffix)
}

pub fn generate_invoice_number(branch_code: &str, date: NaiveDate) -> String {
    invoice_number(branch_code, date, &random_suffix(INVOICE_SUFFIX_LEN))
}

/// `PAY-<CODE>-<YYYY>-<6-digit sequence>`
pub fn payment_number(branch_code: &str, year: i32, sequence: i64) -> String {
    format!("PAY-{}-{}-{:06}", branch_code, year, sequence)
}

/// Atomically allocate the next payment sequence for `(branch, year)`.
#[instrument(skip(conn), fields(branch_id = %branch_id))]
pub async fn next_payment_sequence(
    conn: &mut PgConnection,
    branch_id: Uuid,
    date: NaiveDate,
) -> Result<i64, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["next_payment_sequence"])
        .start_timer();

    let value: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO payment_counters (branch_id, year, last_value)
        VALUES ($1, $2, 1)
        ON CONFLICT (branch_id, year)
        DO UPDATE SET last_value = payment_counters.last_value + 1
        RETURNING last_value
        "#,
    )
    .bind(branch_id)
    .bind(date.year())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("allocate payment number", e))?;

    timer.observe_duration();
    Ok(value)
}
