use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One day of completed weighings for a branch.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DailyTotals {
    pub day: NaiveDate,
    pub completed_count: i64,
    pub total_net_weight: f64,
    pub total_invoiced: f64,
}
