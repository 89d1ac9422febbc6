//! Caller and branch scope extracted from request headers.
//!
//! The upstream auth layer has already verified credentials and sets `X-User-ID` and
//! `X-User-Role`. The branch comes from `X-Branch-ID` when present, otherwise from the
//! user's row in `users`.

use crate::models::{Caller, Role};
use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use service_core::error::AppError;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const BRANCH_ID_HEADER: &str = "x-branch-id";

#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub caller: Caller,
    pub branch_id: Uuid,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn uuid_header(headers: &HeaderMap, name: &str) -> Result<Option<Uuid>, AppError> {
    header(headers, name)
        .map(|raw| {
            Uuid::parse_str(raw)
                .map_err(|_| AppError::BadRequest(anyhow::anyhow!("{} must be a UUID", name)))
        })
        .transpose()
}

/// The caller identity, without resolving the branch.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, AppError> {
    let user_id = uuid_header(headers, USER_ID_HEADER)?
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-ID header")))?;

    let role = header(headers, USER_ROLE_HEADER)
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-User-Role header")))?;
    let role = Role::parse(role)
        .ok_or_else(|| AppError::Forbidden(anyhow::anyhow!("Unknown role '{}'", role)))?;

    Ok(Caller { user_id, role })
}

#[async_trait]
impl FromRequestParts<AppState> for RequestContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let caller = caller_from_headers(&parts.headers)?;

        let branch_id = match uuid_header(&parts.headers, BRANCH_ID_HEADER)? {
            Some(id) => id,
            None => state.db.branch_for_user(caller.user_id).await?.ok_or_else(|| {
                AppError::Forbidden(anyhow::anyhow!("User is not assigned to a branch"))
            })?,
        };

        let span = tracing::Span::current();
        span.record("user_id", tracing::field::display(caller.user_id));
        span.record("branch_id", tracing::field::display(branch_id));

        Ok(RequestContext { caller, branch_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (name, value) in pairs {
            h.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        h
    }

    #[test]
    fn parses_caller_headers() {
        let id = Uuid::new_v4();
        let caller = caller_from_headers(&headers(&[
            (USER_ID_HEADER, &id.to_string()),
            (USER_ROLE_HEADER, "Operator"),
        ]))
        .unwrap();
        assert_eq!(caller.user_id, id);
        assert_eq!(caller.role, Role::Operator);
    }

    #[test]
    fn missing_user_is_unauthorized() {
        let err = caller_from_headers(&headers(&[(USER_ROLE_HEADER, "admin")])).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn malformed_user_id_is_a_bad_request() {
        let err = caller_from_headers(&headers(&[
            (USER_ID_HEADER, "not-a-uuid"),
            (USER_ROLE_HEADER, "admin"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn unknown_role_is_forbidden() {
        let err = caller_from_headers(&headers(&[
            (USER_ID_HEADER, &Uuid::new_v4().to_string()),
            (USER_ROLE_HEADER, "auditor"),
        ]))
        .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
