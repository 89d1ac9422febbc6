//! Idempotency key extraction.
//!
//! The `Idempotency-Key` header wins; the body fields are a fallback for clients that
//! cannot set headers. Keys are trimmed and must be 1..=255 characters.

use axum::http::HeaderMap;
use service_core::error::AppError;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";
pub const MAX_KEY_LEN: usize = 255;

/// Resolve the key for a write. `body_keys` are checked in order after the header.
pub fn resolve_key(headers: &HeaderMap, body_keys: &[Option<&str>]) -> Result<Option<String>, AppError> {
    let from_header = match headers.get(IDEMPOTENCY_HEADER) {
        Some(value) => Some(value.to_str().map_err(|_| {
            AppError::BadRequest(anyhow::anyhow!("Idempotency-Key must be visible ASCII"))
        })?),
        None => None,
    };

    let candidate = from_header
        .into_iter()
        .chain(body_keys.iter().copied().flatten())
        .map(str::trim)
        .find(|k| !k.is_empty());

    match candidate {
        Some(key) if key.chars().count() > MAX_KEY_LEN => Err(AppError::BadRequest(
            anyhow::anyhow!("Idempotency key exceeds {} characters", MAX_KEY_LEN),
        )),
        Some(key) => Ok(Some(key.to_string())),
        None => Ok(None),
    }
}

/// Like [`resolve_key`], but a missing key is a validation failure.
pub fn require_key(headers: &HeaderMap, body_keys: &[Option<&str>]) -> Result<String, AppError> {
    resolve_key(headers, body_keys)?.ok_or_else(|| {
        let mut errors = validator::ValidationErrors::new();
        let mut error = validator::ValidationError::new("required");
        error.message = Some("Idempotency-Key header or idempotency_key field is required".into());
        errors.add("idempotency_key", error);
        AppError::ValidationError(errors)
    })
}
