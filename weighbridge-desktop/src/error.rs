use thiserror::Error;

/// Failure talking to the weighbridge server.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never got an answer (connect failure, timeout, dropped connection).
    #[error("Server unreachable: {0}")]
    Transport(String),

    /// A gateway in front of the server answered instead of the server.
    #[error("Server unavailable (HTTP {0})")]
    Unavailable(u16),

    /// The server answered with an error envelope or an unexpected status.
    #[error("Request rejected (HTTP {status}, {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Whether the write may be queued and replayed later.
    pub fn is_queueable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Unavailable(_) => true,
            ApiError::Rejected { status, .. } => is_retryable_status(*status),
            ApiError::InvalidResponse(_) => false,
        }
    }
}

/// Server-side failures that a later attempt may get past: 5xx (database down,
/// query timeout), 408 from the request timeout, 429 from the rate limiter.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// Failure in the local queue database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue database lock poisoned")]
    Poisoned,

    #[error("Corrupt queue row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("A weighing is already in progress")]
    ActiveTransaction,

    #[error("No weighing is in progress")]
    NoActiveTransaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_and_server_side_failures_are_queueable() {
        assert!(ApiError::Transport("connection refused".into()).is_queueable());
        assert!(ApiError::Unavailable(503).is_queueable());
        assert!(!ApiError::Rejected {
            status: 409,
            code: "conflict".into(),
            message: "second weight differs".into(),
        }
        .is_queueable());
        assert!(!ApiError::InvalidResponse("eof".into()).is_queueable());
    }

    #[test]
    fn transient_server_statuses_are_queueable() {
        for (status, code) in [(500, "database_error"), (408, "http_408"), (429, "too_many_requests")] {
            let err = ApiError::Rejected {
                status,
                code: code.into(),
                message: "try again".into(),
            };
            assert!(err.is_queueable(), "HTTP {status} should stay queued");
        }
        for status in [400, 403, 404, 409, 422] {
            assert!(!is_retryable_status(status), "HTTP {status} is final");
        }
    }
}
