//! Fixed-window request limiting keyed by API key.
//!
//! Counters live behind the [`RateCounter`] trait so that several server instances can
//! share one window through Redis; the in-memory implementation is for tests and
//! single-node development.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared counter store for fixed-window rate limiting.
#[async_trait]
pub trait RateCounter: Send + Sync + 'static {
    /// Increment the counter for `key` in the current window and return the new count.
    async fn incr(&self, key: &str, window: Duration) -> Result<u64, AppError>;
}

/// Redis-backed counter: `INCR` then `EXPIRE` on first hit of a window.
#[derive(Clone)]
pub struct RedisRateCounter {
    manager: ConnectionManager,
}

impl RedisRateCounter {
    pub async fn connect(url: &str) -> Result<Self, AppError> {
        tracing::info!("Connecting rate limiter to Redis");
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::RedisError(e)
        })?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl RateCounter for RedisRateCounter {
    async fn incr(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let mut conn = self.manager.clone();
        let bucket = window_bucket(window);
        let redis_key = format!("ratelimit:{}:{}", key, bucket);

        let count: u64 = redis::cmd("INCR")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&redis_key)
                .arg(window.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
        }

        Ok(count)
    }
}

/// Process-local counter. Windows are never shared across instances.
#[derive(Default)]
pub struct InMemoryRateCounter {
    windows: DashMap<String, (u64, u64)>,
}

impl InMemoryRateCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounter for InMemoryRateCounter {
    async fn incr(&self, key: &str, window: Duration) -> Result<u64, AppError> {
        let bucket = window_bucket(window);
        let mut entry = self.windows.entry(key.to_string()).or_insert((bucket, 0));
        if entry.0 != bucket {
            *entry = (bucket, 0);
        }
        entry.1 += 1;
        Ok(entry.1)
    }
}

fn window_bucket(window: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    now / window.as_secs().max(1)
}

fn seconds_left_in_window(window: Duration) -> u64 {
    let secs = window.as_secs().max(1);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs - (now % secs)
}

/// Limiter state handed to [`api_key_rate_limit_middleware`].
#[derive(Clone)]
pub struct RateLimiter {
    pub counter: Arc<dyn RateCounter>,
    pub limit: u64,
    pub window: Duration,
}

impl RateLimiter {
    pub fn per_minute(counter: Arc<dyn RateCounter>, limit: u64) -> Self {
        Self {
            counter,
            limit,
            window: Duration::from_secs(60),
        }
    }
}

/// Reject requests once an API key (or, without one, a user id) exceeds its window.
///
/// Requests carrying neither identity pass through. A failing counter store does not
/// block traffic; the failure is logged.
pub async fn api_key_rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if limiter.limit == 0 {
        return Ok(next.run(request).await);
    }

    let identity = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|k| format!("key:{}", k))
        .or_else(|| {
            request
                .headers()
                .get("x-user-id")
                .and_then(|v| v.to_str().ok())
                .map(|u| format!("user:{}", u))
        });

    let Some(identity) = identity else {
        return Ok(next.run(request).await);
    };

    match limiter.counter.incr(&identity, limiter.window).await {
        Ok(count) if count > limiter.limit => Err(AppError::TooManyRequests(
            "Rate limit exceeded".to_string(),
            Some(seconds_left_in_window(limiter.window)),
        )),
        Ok(_) => Ok(next.run(request).await),
        Err(e) => {
            tracing::warn!(error = %e, "Rate counter unavailable, allowing request");
            Ok(next.run(request).await)
        }
    }
}
