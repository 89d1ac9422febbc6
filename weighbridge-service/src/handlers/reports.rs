use super::query_params;
use crate::dtos::{DailyReport, DailyReportQuery};
use crate::middleware::RequestContext;
use crate::services::reports;
use crate::startup::AppState;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use service_core::error::AppError;
use service_core::response::Envelope;

pub async fn daily_report(
    State(state): State<AppState>,
    ctx: RequestContext,
    query: Result<Query<DailyReportQuery>, QueryRejection>,
) -> Result<Envelope<DailyReport>, AppError> {
    let query = query_params(query)?;
    let report =
        reports::daily_report(&state.db, &state.report_schema, ctx.branch_id, query.from, query.to)
            .await?;
    Ok(Envelope::ok(report))
}
