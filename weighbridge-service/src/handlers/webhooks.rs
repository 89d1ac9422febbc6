use super::json_body;
use crate::dtos::{PaymentWebhookEvent, WebhookOutcome};
use crate::services::payments;
use crate::startup::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Json, State};
use service_core::error::AppError;
use service_core::response::Envelope;

/// Payment provider callback. Signature verification happens upstream.
pub async fn payment_webhook(
    State(state): State<AppState>,
    payload: Result<Json<PaymentWebhookEvent>, JsonRejection>,
) -> Result<Envelope<WebhookOutcome>, AppError> {
    let event = json_body(payload)?;
    let outcome = payments::apply_invoice_paid(&state.db, &event).await?;
    Ok(Envelope::ok(outcome))
}
