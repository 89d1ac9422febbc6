pub mod database;
pub mod idempotency;
pub mod invoice_issuer;
pub mod lifecycle;
pub mod metrics;
pub mod numbering;
pub mod payments;
pub mod pricing;
pub mod reports;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics};
pub use reports::ReportSchema;
