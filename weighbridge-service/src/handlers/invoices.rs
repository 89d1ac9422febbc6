use super::path_param;
use crate::dtos::InvoiceDetail;
use crate::middleware::RequestContext;
use crate::startup::AppState;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use service_core::error::AppError;
use service_core::response::Envelope;
use uuid::Uuid;

/// Invoice with its line items, as consumed by the renderer.
pub async fn get_invoice(
    State(state): State<AppState>,
    ctx: RequestContext,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Envelope<InvoiceDetail>, AppError> {
    let id = path_param(id)?;
    let invoice = state
        .db
        .get_invoice(ctx.branch_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", id)))?;
    let line_items = state.db.line_items(invoice.id).await?;

    Ok(Envelope::ok(InvoiceDetail {
        invoice,
        line_items,
    }))
}
