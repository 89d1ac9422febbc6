//! HTTP client for the weighbridge service.
//!
//! Every response is decoded as the server's [`ApiResponse`] envelope. Errors are
//! split into transient failures, which may be queued, and refusals, which the
//! operator has to see (see [`ApiError::is_queueable`]).

use crate::config::DesktopConfig;
use crate::error::ApiError;
use crate::models::{CompletePayload, Completion, CreateTransactionPayload, RemoteTransaction};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use service_core::response::ApiResponse;
use tracing::{debug, warn};
use uuid::Uuid;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Server operations the station performs.
#[async_trait]
pub trait WeighbridgeApi: Send + Sync {
    async fn create_transaction(
        &self,
        idempotency_key: &str,
        payload: &CreateTransactionPayload,
    ) -> Result<RemoteTransaction, ApiError>;

    async fn complete_transaction(
        &self,
        transaction_id: Uuid,
        idempotency_key: &str,
        payload: &CompletePayload,
    ) -> Result<Completion, ApiError>;

    async fn health(&self) -> Result<(), ApiError>;
}

/// Strip trailing slashes and default the scheme.
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("http://{url}");
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

/// Statuses produced by a proxy or load balancer when the service is down.
fn is_gateway_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
    user_id: Uuid,
    role: String,
    branch_id: Option<Uuid>,
    api_key: Option<String>,
}

impl HttpApi {
    pub fn new(config: &DesktopConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: normalize_server_url(&config.server_url),
            user_id: config.user_id,
            role: config.role.clone(),
            branch_id: config.branch_id,
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-User-ID", self.user_id.to_string())
            .header("X-User-Role", &self.role);
        if let Some(branch_id) = self.branch_id {
            req = req.header("X-Branch-ID", branch_id.to_string());
        }
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        req
    }

    async fn send<T, B>(&self, req: RequestBuilder, body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let req = match body {
            Some(body) => req.json(body),
            None => req,
        };
        let response = req.send().await.map_err(|e| {
            warn!(error = %e, "Request to weighbridge server failed");
            ApiError::Transport(e.to_string())
        })?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    if is_gateway_status(status) {
        return Err(ApiError::Unavailable(status.as_u16()));
    }

    let text = response.text().await?;
    let envelope = match serde_json::from_str::<ApiResponse<T>>(&text) {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => return Err(ApiError::InvalidResponse(e.to_string())),
        Err(_) => {
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                code: format!("http_{}", status.as_u16()),
                message: text.trim().to_string(),
            })
        }
    };

    envelope.into_result().map_err(|error| {
        if status.is_success() {
            ApiError::InvalidResponse(error.message)
        } else {
            debug!(status = status.as_u16(), code = %error.code, "Server rejected request");
            ApiError::Rejected {
                status: status.as_u16(),
                code: error.code,
                message: error.message,
            }
        }
    })
}

#[async_trait]
impl WeighbridgeApi for HttpApi {
    async fn create_transaction(
        &self,
        idempotency_key: &str,
        payload: &CreateTransactionPayload,
    ) -> Result<RemoteTransaction, ApiError> {
        let req = self
            .request(Method::POST, "/api/transactions")
            .header(IDEMPOTENCY_HEADER, idempotency_key);
        self.send(req, Some(payload)).await
    }

    async fn complete_transaction(
        &self,
        transaction_id: Uuid,
        idempotency_key: &str,
        payload: &CompletePayload,
    ) -> Result<Completion, ApiError> {
        let req = self
            .request(
                Method::POST,
                &format!("/api/transactions/{transaction_id}/complete"),
            )
            .header(IDEMPOTENCY_HEADER, idempotency_key);
        self.send(req, Some(payload)).await
    }

    async fn health(&self) -> Result<(), ApiError> {
        let req = self.request(Method::GET, "/health");
        let _: serde_json::Value = self.send::<_, ()>(req, None).await?;
        Ok(())
    }
}
