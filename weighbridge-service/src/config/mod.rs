//! Configuration module for weighbridge-service.

use crate::services::reports::ReportColumnOverrides;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct WeighbridgeConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub rate_limit: RateLimitConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Shared counter store. Without it each instance counts on its own.
    pub redis_url: Option<Secret<String>>,
    /// Requests per API key per minute; 0 disables limiting.
    pub per_minute: u64,
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub schema_version: u32,
    pub columns: ReportColumnOverrides,
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl WeighbridgeConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "weighbridge-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: non_empty("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parsed("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            rate_limit: RateLimitConfig {
                redis_url: non_empty("REDIS_URL").map(Secret::new),
                per_minute: parsed("RATE_LIMIT_PER_MINUTE", 120)?,
            },
            report: ReportConfig {
                schema_version: parsed("REPORT_SCHEMA_VERSION", 1)?,
                columns: ReportColumnOverrides {
                    completed_at: non_empty("REPORT_COLUMN_COMPLETED_AT"),
                    net_weight: non_empty("REPORT_COLUMN_NET_WEIGHT"),
                    invoice_total: non_empty("REPORT_COLUMN_INVOICE_TOTAL"),
                },
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn invalid_numbers_are_reported_by_name() {
        env::set_var("RATE_LIMIT_PER_MINUTE", "lots");
        let err = parsed::<u64>("RATE_LIMIT_PER_MINUTE", 1).unwrap_err();
        env::remove_var("RATE_LIMIT_PER_MINUTE");
        assert!(err.to_string().contains("RATE_LIMIT_PER_MINUTE"));
    }

    #[test]
    #[serial]
    fn blank_optional_values_are_absent() {
        env::set_var("OTLP_ENDPOINT", "   ");
        assert_eq!(non_empty("OTLP_ENDPOINT"), None);
        env::remove_var("OTLP_ENDPOINT");
    }
}
