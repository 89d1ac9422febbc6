//! Daily branch report.
//!
//! Column names used by the report are not hard-coded: a versioned [`ReportSchema`]
//! maps each logical field to a physical column. The mapping comes from configuration
//! and is checked against `information_schema` once at startup.

use crate::dtos::DailyReport;
use crate::models::DailyTotals;
use crate::services::database::{db_error, Database};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::NaiveDate;
use serde::Deserialize;
use service_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

/// Widest range a single report may cover.
pub const MAX_REPORT_DAYS: i64 = 366;

/// Column overrides; unset fields keep the version's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportColumnOverrides {
    pub completed_at: Option<String>,
    pub net_weight: Option<String>,
    pub invoice_total: Option<String>,
}

/// Logical report field to physical column mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSchema {
    pub version: u32,
    /// Completion timestamp on `transactions`.
    pub completed_at: String,
    /// Net weight on `transactions`.
    pub net_weight: String,
    /// Invoiced total on `invoices`.
    pub invoice_total: String,
}

impl ReportSchema {
    /// Defaults for a schema version.
    ///
    /// Version 1 is the current layout. Version 2 covers databases migrated from the
    /// legacy layout, where the columns kept their old names.
    pub fn for_version(version: u32) -> Result<Self, AppError> {
        let (completed_at, net_weight, invoice_total) = match version {
            1 => ("second_weight_time", "net_weight", "total_amount"),
            2 => ("completed_at", "net_weight_kg", "total"),
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown report schema version {}",
                    other
                )))
            }
        };
        Ok(Self {
            version,
            completed_at: completed_at.to_string(),
            net_weight: net_weight.to_string(),
            invoice_total: invoice_total.to_string(),
        })
    }

    pub fn resolve(version: u32, overrides: &ReportColumnOverrides) -> Result<Self, AppError> {
        let mut schema = Self::for_version(version)?;
        if let Some(c) = &overrides.completed_at {
            schema.completed_at = c.clone();
        }
        if let Some(c) = &overrides.net_weight {
            schema.net_weight = c.clone();
        }
        if let Some(c) = &overrides.invoice_total {
            schema.invoice_total = c.clone();
        }

        for column in [&schema.completed_at, &schema.net_weight, &schema.invoice_total] {
            if !is_identifier(column) {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Report column '{}' is not a valid identifier",
                    column
                )));
            }
        }
        Ok(schema)
    }

    /// Fail unless every mapped column exists.
    #[instrument(skip(self, db), fields(version = self.version))]
    pub async fn verify(&self, db: &Database) -> Result<(), AppError> {
        let transaction_columns = db.table_columns("transactions").await?;
        let invoice_columns = db.table_columns("invoices").await?;

        let missing: Vec<String> = [
            ("transactions", &self.completed_at, &transaction_columns),
            ("transactions", &self.net_weight, &transaction_columns),
            ("invoices", &self.invoice_total, &invoice_columns),
        ]
        .into_iter()
        .filter(|(_, column, existing)| !existing.iter().any(|c| c == *column))
        .map(|(table, column, _)| format!("{}.{}", table, column))
        .collect();

        if !missing.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Report schema v{} references missing columns: {}",
                self.version,
                missing.join(", ")
            )));
        }

        info!("Report schema verified");
        Ok(())
    }

    pub fn daily_totals_sql(&self) -> String {
        format!(
            r#"
            SELECT (t.{completed_at})::date AS day,
                   COUNT(*)::bigint AS completed_count,
                   COALESCE(SUM(t.{net_weight}), 0)::float8 AS total_net_weight,
                   COALESCE(SUM(i.{invoice_total}), 0)::float8 AS total_invoiced
            FROM transactions t
            LEFT JOIN invoices i ON i.transaction_id = t.id AND i.branch_id = t.branch_id
            WHERE t.branch_id = $1
              AND t.status = 'completed'
              AND (t.{completed_at})::date BETWEEN $2 AND $3
            GROUP BY 1
            ORDER BY 1
            "#,
            completed_at = self.completed_at,
            net_weight = self.net_weight,
            invoice_total = self.invoice_total,
        )
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && name.len() <= 63
}

#[instrument(skip(db, schema), fields(branch_id = %branch_id))]
pub async fn daily_report(
    db: &Database,
    schema: &ReportSchema,
    branch_id: Uuid,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<DailyReport, AppError> {
    if from > to {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "'from' must not be after 'to'"
        )));
    }
    if (to - from).num_days() >= MAX_REPORT_DAYS {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Report range may not exceed {} days",
            MAX_REPORT_DAYS
        )));
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["daily_report"])
        .start_timer();

    let days = sqlx::query_as::<_, DailyTotals>(&schema.daily_totals_sql())
        .bind(branch_id)
        .bind(from)
        .bind(to)
        .fetch_all(db.pool())
        .await
        .map_err(|e| db_error("build daily report", e))?;

    timer.observe_duration();

    Ok(DailyReport {
        branch_id,
        from,
        to,
        days,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_one_maps_to_current_columns() {
        let schema = ReportSchema::resolve(1, &ReportColumnOverrides::default()).unwrap();
        assert_eq!(schema.completed_at, "second_weight_time");
        assert_eq!(schema.net_weight, "net_weight");
        assert_eq!(schema.invoice_total, "total_amount");
    }

    #[test]
    fn overrides_replace_single_columns() {
        let overrides = ReportColumnOverrides {
            net_weight: Some("net_kg".to_string()),
            ..Default::default()
        };
        let schema = ReportSchema::resolve(1, &overrides).unwrap();
        assert_eq!(schema.net_weight, "net_kg");
        assert_eq!(schema.completed_at, "second_weight_time");
        assert!(schema.daily_totals_sql().contains("SUM(t.net_kg)"));
    }

    #[test]
    fn unknown_version_is_a_config_error() {
        let err = ReportSchema::resolve(9, &ReportColumnOverrides::default()).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn injected_column_names_are_rejected() {
        let overrides = ReportColumnOverrides {
            invoice_total: Some("total); DROP TABLE invoices; --".to_string()),
            ..Default::default()
        };
        assert!(ReportSchema::resolve(1, &overrides).is_err());
    }
}
