//! HTTP handlers for weighbridge-service.
//!
//! Extractor rejections are mapped to `AppError` so that malformed input gets the same
//! envelope as every other failure.

pub mod health;
pub mod invoices;
pub mod reports;
pub mod transactions;
pub mod webhooks;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Json, Path, Query};
use service_core::error::AppError;

pub use health::{health_check, metrics, readiness_check};

pub(crate) fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))
}

pub(crate) fn path_param<T>(param: Result<Path<T>, PathRejection>) -> Result<T, AppError> {
    param
        .map(|Path(value)| value)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))
}

pub(crate) fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    query
        .map(|Query(value)| value)
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))
}

/// A single-field validation failure.
pub(crate) fn invalid_field(field: &'static str, message: &str) -> AppError {
    let mut error = validator::ValidationError::new("invalid");
    error.message = Some(message.to_string().into());
    let mut errors = validator::ValidationErrors::new();
    errors.add(field, error);
    AppError::ValidationError(errors)
}
