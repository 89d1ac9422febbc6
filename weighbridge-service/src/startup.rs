//! Application startup and lifecycle management.

use crate::config::WeighbridgeConfig;
use crate::handlers;
use crate::services::{init_metrics, Database, ReportSchema};
use axum::body::Body;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::rate_limit::{
    api_key_rate_limit_middleware, InMemoryRateCounter, RateCounter, RateLimiter,
    RedisRateCounter,
};
use service_core::middleware::tracing::{make_request_span, request_id_middleware};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: WeighbridgeConfig,
    pub db: Arc<Database>,
    pub rate_limiter: RateLimiter,
    pub report_schema: Arc<ReportSchema>,
}

/// Build the HTTP router over `state`.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route(
            "/api/transactions",
            post(handlers::transactions::create_transaction)
                .get(handlers::transactions::list_transactions),
        )
        .route(
            "/api/transactions/:id",
            get(handlers::transactions::get_transaction),
        )
        .route(
            "/api/transactions/:id/complete",
            post(handlers::transactions::complete_transaction),
        )
        .route(
            "/api/transactions/:id/cancel",
            post(handlers::transactions::cancel_transaction),
        )
        .route("/api/invoices/:id", get(handlers::invoices::get_invoice))
        .route("/api/reports/daily", get(handlers::reports::daily_report))
        .route(
            "/api/webhooks/payments",
            post(handlers::webhooks::payment_webhook),
        )
        .route_layer(from_fn_with_state(
            state.rate_limiter.clone(),
            api_key_rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .merge(api)
        .route_layer(from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(state.config.common.request_timeout()))
        .layer(TraceLayer::new_for_http().make_span_with(make_request_span::<Body>))
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: WeighbridgeConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: WeighbridgeConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: WeighbridgeConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let report_schema =
            ReportSchema::resolve(config.report.schema_version, &config.report.columns)?;
        report_schema.verify(&db).await.map_err(|e| {
            tracing::error!(error = %e, "Report schema does not match the database");
            e
        })?;

        let counter: Arc<dyn RateCounter> = match &config.rate_limit.redis_url {
            Some(url) => match RedisRateCounter::connect(url.expose_secret()).await {
                Ok(counter) => Arc::new(counter),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis unavailable - rate limit counters are local to this instance");
                    Arc::new(InMemoryRateCounter::new())
                }
            },
            None => {
                tracing::info!("REDIS_URL not set - rate limit counters are local to this instance");
                Arc::new(InMemoryRateCounter::new())
            }
        };

        let state = AppState {
            rate_limiter: RateLimiter::per_minute(counter, config.rate_limit.per_minute),
            report_schema: Arc::new(report_schema),
            db: Arc::new(db),
            config: config.clone(),
        };

        // Port 0 picks a free port (tests)
        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Weighbridge service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = router(self.state);

        tracing::info!(
            service = "weighbridge-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}
