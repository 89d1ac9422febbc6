//! Database row models.

pub mod branch;
pub mod invoice;
pub mod payment;
pub mod pricing;
pub mod report;
pub mod transaction;

pub use branch::{Branch, Caller, Role};
pub use invoice::{balance_of, Invoice, InvoiceLineItem, InvoiceStatus};
pub use payment::{webhook_reference, Payment};
pub use pricing::{ClientPricing, PricingTier};
pub use report::DailyTotals;
pub use transaction::{NewTransaction, Transaction, TransactionStatus, TransactionType};
