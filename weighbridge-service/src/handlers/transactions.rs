use super::{invalid_field, json_body, path_param, query_params};
use crate::dtos::{
    CompleteTransactionRequest, CompletionResponse, CreateTransactionRequest,
    ListTransactionsQuery, TransactionPage,
};
use crate::middleware::RequestContext;
use crate::models::{NewTransaction, Transaction, TransactionStatus, TransactionType};
use crate::services::{idempotency, lifecycle};
use crate::startup::AppState;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Json, Path, Query, State};
use axum::http::HeaderMap;
use service_core::error::AppError;
use service_core::response::Envelope;
use uuid::Uuid;
use validator::Validate;

/// `POST /api/transactions`: 201 for a new row, 200 when the key was already used.
pub async fn create_transaction(
    State(state): State<AppState>,
    ctx: RequestContext,
    headers: HeaderMap,
    payload: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> Result<Envelope<Transaction>, AppError> {
    let req = json_body(payload)?;
    let key = idempotency::require_key(
        &headers,
        &[req.idempotency_key.as_deref(), req.client_request_id.as_deref()],
    )?;
    req.validate()?;

    let transaction_type = TransactionType::parse(req.transaction_type.trim()).ok_or_else(|| {
        invalid_field("transaction_type", "transaction_type must be inbound or outbound")
    })?;

    let input = NewTransaction {
        branch_id: ctx.branch_id,
        client_id: req.client_id,
        vehicle_id: req.vehicle_id,
        operator_id: req.operator_id.unwrap_or(ctx.caller.user_id),
        transaction_type,
        first_weight: req.first_weight,
        material_type: req.material_type,
        reference_number: req.reference_number,
        notes: req.notes,
        idempotency_key: key,
    };

    let outcome = lifecycle::create(&state.db, input).await?;
    Ok(if outcome.replayed {
        Envelope::ok(outcome.transaction)
    } else {
        Envelope::created(outcome.transaction)
    })
}

pub async fn list_transactions(
    State(state): State<AppState>,
    ctx: RequestContext,
    query: Result<Query<ListTransactionsQuery>, QueryRejection>,
) -> Result<Envelope<TransactionPage>, AppError> {
    let query = query_params(query)?;
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| {
            TransactionStatus::parse(s)
                .ok_or_else(|| invalid_field("status", "unknown transaction status"))
        })
        .transpose()?;
    let (page, per_page) = query.paging();

    let (items, total) = state
        .db
        .list_transactions(ctx.branch_id, status, page, per_page)
        .await?;

    Ok(Envelope::ok(TransactionPage {
        items,
        page,
        per_page,
        total,
    }))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Envelope<Transaction>, AppError> {
    let id = path_param(id)?;
    state
        .db
        .get_transaction(ctx.branch_id, id)
        .await?
        .map(Envelope::ok)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction {} not found", id)))
}

/// `POST /api/transactions/:id/complete`
pub async fn complete_transaction(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<Uuid>, PathRejection>,
    headers: HeaderMap,
    payload: Result<Json<CompleteTransactionRequest>, JsonRejection>,
) -> Result<Envelope<CompletionResponse>, AppError> {
    let id = path_param(id)?;
    let req = json_body(payload)?;
    let key = idempotency::require_key(&headers, &[req.idempotency_key.as_deref()])?;
    req.validate()?;

    let response = lifecycle::complete(
        &state.db,
        ctx.branch_id,
        id,
        req.second_weight,
        &ctx.caller,
        &key,
    )
    .await?;

    Ok(Envelope::ok(response))
}

pub async fn cancel_transaction(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Envelope<Transaction>, AppError> {
    let id = path_param(id)?;
    let transaction = lifecycle::cancel(&state.db, ctx.branch_id, id, &ctx.caller).await?;
    Ok(Envelope::ok(transaction))
}
