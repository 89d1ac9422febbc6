//! Database service for weighbridge-service.
//!
//! `Database` owns the pool and the branch-scoped reads. The free functions take a
//! `PgConnection` so the workflow modules can run them inside their own transaction.

use crate::models::invoice::INVOICE_COLUMNS;
use crate::models::transaction::TRANSACTION_COLUMNS;
use crate::models::{Branch, Invoice, InvoiceLineItem, Transaction, TransactionStatus};
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Map a sqlx error to `AppError::DatabaseError` with the failing operation.
pub(crate) fn db_error(operation: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", operation, e))
}

/// True when `e` is a unique violation, optionally of one named constraint or index.
pub(crate) fn is_unique_violation(e: &sqlx::Error, constraint: Option<&str>) -> bool {
    match e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            constraint.map_or(true, |name| db_err.constraint() == Some(name))
        }
        _ => false,
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "weighbridge-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tenant scope
    // -------------------------------------------------------------------------

    /// The branch a user belongs to.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn branch_for_user(&self, user_id: Uuid) -> Result<Option<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["branch_for_user"])
            .start_timer();

        let branch_id = sqlx::query_scalar::<_, Uuid>("SELECT branch_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("resolve user branch", e))?;

        timer.observe_duration();
        Ok(branch_id)
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(branch_id = %branch_id, transaction_id = %id))]
    pub async fn get_transaction(
        &self,
        branch_id: Uuid,
        id: Uuid,
    ) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE branch_id = $1 AND id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(branch_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get transaction", e))?;

        timer.observe_duration();
        Ok(row)
    }

    /// Newest first. Returns the page and the total matching count.
    #[instrument(skip(self), fields(branch_id = %branch_id))]
    pub async fn list_transactions(
        &self,
        branch_id: Uuid,
        status: Option<TransactionStatus>,
        page: u32,
        per_page: u32,
    ) -> Result<(Vec<Transaction>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let status = status.map(|s| s.as_str());
        let offset = i64::from(page.saturating_sub(1)) * i64::from(per_page);

        let rows = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE branch_id = $1 AND ($2::varchar IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(branch_id)
        .bind(status)
        .bind(i64::from(per_page))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list transactions", e))?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM transactions WHERE branch_id = $1 AND ($2::varchar IS NULL OR status = $2)",
        )
        .bind(branch_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count transactions", e))?;

        timer.observe_duration();
        Ok((rows, total))
    }

    // -------------------------------------------------------------------------
    // Invoices
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(branch_id = %branch_id, invoice_id = %id))]
    pub async fn get_invoice(&self, branch_id: Uuid, id: Uuid) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE branch_id = $1 AND id = $2",
            INVOICE_COLUMNS
        ))
        .bind(branch_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn line_items(&self, invoice_id: Uuid) -> Result<Vec<InvoiceLineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, InvoiceLineItem>(
            r#"
            SELECT id, invoice_id, description, quantity, unit_price, amount, created_at
            FROM invoice_line_items
            WHERE invoice_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list line items", e))?;

        timer.observe_duration();
        Ok(items)
    }

    // -------------------------------------------------------------------------
    // Schema introspection
    // -------------------------------------------------------------------------

    /// Column names of a table in the current schema.
    #[instrument(skip(self))]
    pub async fn table_columns(&self, table: &str) -> Result<Vec<String>, AppError> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT column_name::text FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("read table columns", e))
    }
}

// -----------------------------------------------------------------------------
// Connection-scoped helpers
// -----------------------------------------------------------------------------

#[instrument(skip(conn), fields(branch_id = %branch_id))]
pub(crate) async fn fetch_branch(
    conn: &mut PgConnection,
    branch_id: Uuid,
) -> Result<Branch, AppError> {
    sqlx::query_as::<_, Branch>(
        "SELECT id, code, name, tax_rate, payment_terms FROM branches WHERE id = $1",
    )
    .bind(branch_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("get branch", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Branch {} not found", branch_id)))
}

/// The invoice issued for a transaction, if any.
pub(crate) async fn invoice_for_transaction(
    conn: &mut PgConnection,
    branch_id: Uuid,
    transaction_id: Uuid,
) -> Result<Option<Invoice>, AppError> {
    sqlx::query_as::<_, Invoice>(&format!(
        "SELECT {} FROM invoices WHERE branch_id = $1 AND transaction_id = $2",
        INVOICE_COLUMNS
    ))
    .bind(branch_id)
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("find invoice for transaction", e))
}
