//! Transaction lifecycle: create, complete, cancel.
//!
//! Every call runs in one database transaction. Inserts that may collide on a unique
//! index run inside a savepoint so the outer transaction survives the violation and can
//! retry or look up the winner.

use crate::dtos::CompletionResponse;
use crate::models::transaction::TRANSACTION_COLUMNS;
use crate::models::{
    Caller, ClientPricing, NewTransaction, PricingTier, Transaction, TransactionStatus,
};
use crate::services::database::{db_error, fetch_branch, invoice_for_transaction, is_unique_violation, Database};
use crate::services::invoice_issuer;
use crate::services::metrics::{
    DB_QUERY_DURATION, IDEMPOTENT_REPLAYS, TRANSACTIONS_COMPLETED, TRANSACTIONS_CREATED,
};
use crate::services::numbering::{generate_transaction_number, TRANSACTION_NUMBER_ATTEMPTS};
use crate::services::pricing;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::{Connection, PgConnection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Two second weights closer than this are the same reading.
pub const WEIGHT_TOLERANCE: f64 = 1e-4;

const KEY_INDEX: &str = "uq_transactions_branch_request";
const NUMBER_CONSTRAINT: &str = "uq_transactions_number";

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub transaction: Transaction,
    /// True when the key had already been used and the stored row was returned.
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionDecision {
    /// Open transaction, proceed with pricing and invoicing.
    Fresh,
    /// Already completed with the same second weight.
    Replay,
}

pub fn net_weight(first_weight: f64, second_weight: f64) -> f64 {
    (first_weight - second_weight).abs()
}

fn ensure_weight(field: &str, value: f64) -> Result<(), AppError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(AppError::BadRequest(anyhow::anyhow!(
            "{} must be a finite, non-negative number",
            field
        )))
    }
}

/// Decide what a completion request against `transaction` should do.
pub fn decide_completion(
    transaction: &Transaction,
    second_weight: f64,
    caller: &Caller,
) -> Result<CompletionDecision, AppError> {
    if !caller.may_act_for(transaction.operator_id) {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Operators may only complete their own transactions"
        )));
    }

    match transaction.parsed_status() {
        Some(TransactionStatus::Completed) => match transaction.second_weight {
            Some(stored) if (stored - second_weight).abs() <= WEIGHT_TOLERANCE => {
                Ok(CompletionDecision::Replay)
            }
            Some(stored) => Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} was already completed with second weight {}",
                transaction.transaction_number,
                stored
            ))),
            None => Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} is completed without a second weight",
                transaction.transaction_number
            ))),
        },
        Some(status) if status.is_open() => Ok(CompletionDecision::Fresh),
        _ => Err(AppError::Conflict(anyhow::anyhow!(
            "Transaction {} is not pending (status: {})",
            transaction.transaction_number,
            transaction.status
        ))),
    }
}

// -----------------------------------------------------------------------------
// Create
// -----------------------------------------------------------------------------

#[instrument(
    skip(db, input),
    fields(branch_id = %input.branch_id, idempotency_key = %input.idempotency_key)
)]
pub async fn create(db: &Database, input: NewTransaction) -> Result<CreateOutcome, AppError> {
    ensure_weight("first_weight", input.first_weight)?;

    let mut tx = db
        .pool()
        .begin()
        .await
        .map_err(|e| db_error("begin transaction", e))?;

    if let Some(existing) =
        find_by_key(&mut tx, input.branch_id, &input.idempotency_key).await?
    {
        tx.rollback().await.ok();
        return Ok(replayed(existing));
    }

    let branch = fetch_branch(&mut tx, input.branch_id).await?;
    ensure_references(&mut tx, &input).await?;

    let today = Utc::now().date_naive();
    for attempt in 1..=TRANSACTION_NUMBER_ATTEMPTS {
        let number = generate_transaction_number(&branch.code, today);

        let mut savepoint = (*tx)
            .begin()
            .await
            .map_err(|e| db_error("open savepoint", e))?;
        let inserted = insert_transaction(&mut savepoint, &input, &number).await;

        match inserted {
            Ok(row) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| db_error("release savepoint", e))?;
                tx.commit()
                    .await
                    .map_err(|e| db_error("commit transaction", e))?;

                TRANSACTIONS_CREATED.with_label_values(&["created"]).inc();
                info!(
                    transaction_id = %row.id,
                    transaction_number = %row.transaction_number,
                    "Transaction created"
                );
                return Ok(CreateOutcome {
                    transaction: row,
                    replayed: false,
                });
            }
            Err(e) if is_unique_violation(&e, Some(KEY_INDEX)) => {
                savepoint.rollback().await.ok();
                let winner = find_by_key(&mut tx, input.branch_id, &input.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict(anyhow::anyhow!(
                            "Idempotency key was claimed by a request that did not commit"
                        ))
                    })?;
                tx.commit()
                    .await
                    .map_err(|e| db_error("commit transaction", e))?;
                return Ok(replayed(winner));
            }
            Err(e) if is_unique_violation(&e, Some(NUMBER_CONSTRAINT)) => {
                savepoint.rollback().await.ok();
                warn!(attempt, number = %number, "Transaction number collision, regenerating");
            }
            Err(e) => return Err(db_error("insert transaction", e)),
        }
    }

    Err(AppError::Conflict(anyhow::anyhow!(
        "Could not allocate a unique transaction number after {} attempts",
        TRANSACTION_NUMBER_ATTEMPTS
    )))
}

fn replayed(transaction: Transaction) -> CreateOutcome {
    TRANSACTIONS_CREATED.with_label_values(&["replayed"]).inc();
    IDEMPOTENT_REPLAYS.with_label_values(&["create_transaction"]).inc();
    info!(transaction_id = %transaction.id, "Idempotent create replayed");
    CreateOutcome {
        transaction,
        replayed: true,
    }
}

async fn find_by_key(
    conn: &mut PgConnection,
    branch_id: Uuid,
    key: &str,
) -> Result<Option<Transaction>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["find_transaction_by_key"])
        .start_timer();

    let row = sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {} FROM transactions WHERE branch_id = $1 AND client_request_id = $2",
        TRANSACTION_COLUMNS
    ))
    .bind(branch_id)
    .bind(key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("check idempotency key", e))?;

    timer.observe_duration();
    Ok(row)
}

/// Client, vehicle and operator must all belong to the branch.
async fn ensure_references(conn: &mut PgConnection, input: &NewTransaction) -> Result<(), AppError> {
    let client_ok: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM clients WHERE id = $1 AND branch_id = $2)",
    )
    .bind(input.client_id)
    .bind(input.branch_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("check client", e))?;
    if !client_ok {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Client {} not found",
            input.client_id
        )));
    }

    let vehicle_ok: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM vehicles v JOIN clients c ON c.id = v.client_id
            WHERE v.id = $1 AND c.branch_id = $2
        )
        "#,
    )
    .bind(input.vehicle_id)
    .bind(input.branch_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("check vehicle", e))?;
    if !vehicle_ok {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Vehicle {} not found",
            input.vehicle_id
        )));
    }

    let operator_ok: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1 AND branch_id = $2)",
    )
    .bind(input.operator_id)
    .bind(input.branch_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("check operator", e))?;
    if !operator_ok {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Operator {} not found",
            input.operator_id
        )));
    }

    Ok(())
}

async fn insert_transaction(
    conn: &mut PgConnection,
    input: &NewTransaction,
    number: &str,
) -> Result<Transaction, sqlx::Error> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_transaction"])
        .start_timer();

    let row = sqlx::query_as::<_, Transaction>(&format!(
        r#"
        INSERT INTO transactions (
            id, branch_id, client_id, vehicle_id, operator_id, transaction_number,
            transaction_type, status, first_weight, first_weight_time,
            material_type, reference_number, notes, client_request_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, NOW(), $9, $10, $11, $12)
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(input.branch_id)
    .bind(input.client_id)
    .bind(input.vehicle_id)
    .bind(input.operator_id)
    .bind(number)
    .bind(input.transaction_type.as_str())
    .bind(input.first_weight)
    .bind(&input.material_type)
    .bind(&input.reference_number)
    .bind(&input.notes)
    .bind(&input.idempotency_key)
    .fetch_one(&mut *conn)
    .await;

    timer.observe_duration();
    row
}

// -----------------------------------------------------------------------------
// Complete
// -----------------------------------------------------------------------------

#[instrument(
    skip(db, caller),
    fields(branch_id = %branch_id, transaction_id = %transaction_id, user_id = %caller.user_id)
)]
pub async fn complete(
    db: &Database,
    branch_id: Uuid,
    transaction_id: Uuid,
    second_weight: f64,
    caller: &Caller,
    idempotency_key: &str,
) -> Result<CompletionResponse, AppError> {
    ensure_weight("second_weight", second_weight)?;

    let mut tx = db
        .pool()
        .begin()
        .await
        .map_err(|e| db_error("begin transaction", e))?;

    let current = lock_transaction(&mut tx, branch_id, transaction_id).await?;

    let decision = match decide_completion(&current, second_weight, caller) {
        Ok(d) => d,
        Err(e) => {
            if matches!(e, AppError::Conflict(_)) {
                TRANSACTIONS_COMPLETED.with_label_values(&["conflict"]).inc();
            }
            return Err(e);
        }
    };

    if decision == CompletionDecision::Replay {
        let invoice = invoice_for_transaction(&mut tx, branch_id, transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Completed transaction {} has no invoice",
                    transaction_id
                ))
            })?;
        tx.rollback().await.ok();

        TRANSACTIONS_COMPLETED.with_label_values(&["replayed"]).inc();
        IDEMPOTENT_REPLAYS.with_label_values(&["complete_transaction"]).inc();
        info!(idempotency_key, "Idempotent completion replayed");

        return Ok(CompletionResponse {
            transaction: current,
            invoice,
            pricing: None,
        });
    }

    let net = net_weight(current.first_weight, second_weight);
    let now = Utc::now();
    let tier = default_tier(&mut tx, branch_id).await?;
    let client_override = active_client_pricing(&mut tx, branch_id, current.client_id, now).await?;
    let priced = pricing::resolve(net, tier.as_ref(), client_override.as_ref());

    let completed = mark_completed(&mut tx, &current, second_weight, net).await?;
    let issued = invoice_issuer::issue_for(&mut tx, &completed, &priced).await?;

    tx.commit()
        .await
        .map_err(|e| db_error("commit transaction", e))?;

    TRANSACTIONS_COMPLETED.with_label_values(&["completed"]).inc();
    info!(
        idempotency_key,
        net_weight = net,
        invoice_id = %issued.invoice.id,
        subtotal = priced.subtotal,
        "Transaction completed"
    );

    Ok(CompletionResponse {
        transaction: completed,
        invoice: issued.invoice,
        pricing: Some(priced),
    })
}

/// `SELECT ... FOR UPDATE` on the branch's transaction row.
async fn lock_transaction(
    conn: &mut PgConnection,
    branch_id: Uuid,
    transaction_id: Uuid,
) -> Result<Transaction, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_transaction"])
        .start_timer();

    let row = sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {} FROM transactions WHERE branch_id = $1 AND id = $2 FOR UPDATE",
        TRANSACTION_COLUMNS
    ))
    .bind(branch_id)
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("lock transaction", e))?;

    timer.observe_duration();
    row.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("Transaction {} not found", transaction_id))
    })
}

async fn default_tier(
    conn: &mut PgConnection,
    branch_id: Uuid,
) -> Result<Option<PricingTier>, AppError> {
    sqlx::query_as::<_, PricingTier>(
        r#"
        SELECT id, branch_id, name, price_per_weighing, price_per_kg, minimum_charge, is_default, is_active
        FROM pricing_tiers
        WHERE branch_id = $1 AND is_default AND is_active
        LIMIT 1
        "#,
    )
    .bind(branch_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("load default pricing tier", e))
}

/// The override in effect at `at`; the most recently started one wins.
async fn active_client_pricing(
    conn: &mut PgConnection,
    branch_id: Uuid,
    client_id: Uuid,
    at: DateTime<Utc>,
) -> Result<Option<ClientPricing>, AppError> {
    sqlx::query_as::<_, ClientPricing>(
        r#"
        SELECT id, branch_id, client_id, price_per_weighing, price_per_kg, minimum_charge,
               discount_percentage, effective_from, effective_until, is_active
        FROM client_pricing
        WHERE branch_id = $1 AND client_id = $2 AND is_active
          AND effective_from <= $3
          AND (effective_until IS NULL OR effective_until > $3)
        ORDER BY effective_from DESC
        LIMIT 1
        "#,
    )
    .bind(branch_id)
    .bind(client_id)
    .bind(at)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| db_error("load client pricing", e))
}

async fn mark_completed(
    conn: &mut PgConnection,
    current: &Transaction,
    second_weight: f64,
    net: f64,
) -> Result<Transaction, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["complete_transaction"])
        .start_timer();

    let row = sqlx::query_as::<_, Transaction>(&format!(
        r#"
        UPDATE transactions
        SET status = 'completed', second_weight = $3, net_weight = $4,
            second_weight_time = NOW(), updated_at = NOW()
        WHERE branch_id = $1 AND id = $2
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(current.branch_id)
    .bind(current.id)
    .bind(second_weight)
    .bind(net)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| db_error("complete transaction", e))?;

    timer.observe_duration();
    Ok(row)
}

// -----------------------------------------------------------------------------
// Cancel
// -----------------------------------------------------------------------------

#[instrument(skip(db, caller), fields(branch_id = %branch_id, transaction_id = %transaction_id))]
pub async fn cancel(
    db: &Database,
    branch_id: Uuid,
    transaction_id: Uuid,
    caller: &Caller,
) -> Result<Transaction, AppError> {
    let mut tx = db
        .pool()
        .begin()
        .await
        .map_err(|e| db_error("begin transaction", e))?;

    let current = lock_transaction(&mut tx, branch_id, transaction_id).await?;

    if !caller.may_act_for(current.operator_id) {
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Operators may only cancel their own transactions"
        )));
    }
    if !current.parsed_status().is_some_and(|s| s.is_open()) {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Transaction {} cannot be cancelled (status: {})",
            current.transaction_number,
            current.status
        )));
    }

    let row = sqlx::query_as::<_, Transaction>(&format!(
        r#"
        UPDATE transactions SET status = 'cancelled', updated_at = NOW()
        WHERE branch_id = $1 AND id = $2
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(branch_id)
    .bind(transaction_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| db_error("cancel transaction", e))?;

    tx.commit()
        .await
        .map_err(|e| db_error("commit transaction", e))?;

    info!(transaction_number = %row.transaction_number, "Transaction cancelled");
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn transaction(status: TransactionStatus, second_weight: Option<f64>, operator: Uuid) -> Transaction {
        let now = Utc::now();
        Transaction {
            id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            operator_id: operator,
            transaction_number: "MNL-20250107-AB12C".to_string(),
            transaction_type: "inbound".to_string(),
            status: status.as_str().to_string(),
            first_weight: 1000.0,
            second_weight,
            net_weight: second_weight.map(|s| net_weight(1000.0, s)),
            first_weight_time: now,
            second_weight_time: second_weight.map(|_| now),
            material_type: None,
            reference_number: None,
            notes: None,
            client_request_id: Some("key-1".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    fn caller(role: Role, user_id: Uuid) -> Caller {
        Caller { user_id, role }
    }

    #[test]
    fn net_weight_is_symmetric() {
        assert_eq!(net_weight(1000.0, 400.0), 600.0);
        assert_eq!(net_weight(400.0, 1000.0), 600.0);
    }

    #[test]
    fn open_transaction_is_completed_fresh() {
        let op = Uuid::new_v4();
        for status in [TransactionStatus::Pending, TransactionStatus::InProgress] {
            let tx = transaction(status, None, op);
            let decision = decide_completion(&tx, 400.0, &caller(Role::Operator, op)).unwrap();
            assert_eq!(decision, CompletionDecision::Fresh);
        }
    }

    #[test]
    fn same_second_weight_within_tolerance_replays() {
        let op = Uuid::new_v4();
        let tx = transaction(TransactionStatus::Completed, Some(400.0), op);
        let decision =
            decide_completion(&tx, 400.00005, &caller(Role::Manager, Uuid::new_v4())).unwrap();
        assert_eq!(decision, CompletionDecision::Replay);
    }

    #[test]
    fn different_second_weight_conflicts_and_names_stored_value() {
        let op = Uuid::new_v4();
        let tx = transaction(TransactionStatus::Completed, Some(400.0), op);
        let err = decide_completion(&tx, 450.0, &caller(Role::Admin, op)).unwrap_err();
        match err {
            AppError::Conflict(e) => assert!(e.to_string().contains("400")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_transaction_is_not_pending() {
        let op = Uuid::new_v4();
        let tx = transaction(TransactionStatus::Cancelled, None, op);
        let err = decide_completion(&tx, 400.0, &caller(Role::Admin, op)).unwrap_err();
        match err {
            AppError::Conflict(e) => assert!(e.to_string().contains("not pending")),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn operator_cannot_complete_another_operators_transaction() {
        let tx = transaction(TransactionStatus::Pending, None, Uuid::new_v4());
        let err =
            decide_completion(&tx, 400.0, &caller(Role::Operator, Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn managers_may_complete_any_transaction() {
        let tx = transaction(TransactionStatus::Pending, None, Uuid::new_v4());
        let decision =
            decide_completion(&tx, 400.0, &caller(Role::Manager, Uuid::new_v4())).unwrap();
        assert_eq!(decision, CompletionDecision::Fresh);
    }

    #[test]
    fn weights_must_be_finite_and_non_negative() {
        assert!(ensure_weight("w", 0.0).is_ok());
        assert!(ensure_weight("w", -0.5).is_err());
        assert!(ensure_weight("w", f64::NAN).is_err());
        assert!(ensure_weight("w", f64::INFINITY).is_err());
    }
}
