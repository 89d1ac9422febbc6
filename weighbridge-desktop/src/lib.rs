//! Operator-side client for the weighbridge service.
//!
//! Writes go to the server directly. When the server cannot be reached they are
//! persisted to a local SQLite queue with the idempotency key generated at the
//! operator's action, and replayed later by the [`sync`] loop.

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod sync;

#[cfg(test)]
mod fake;

pub use api::{HttpApi, WeighbridgeApi};
pub use config::DesktopConfig;
pub use error::{ApiError, SessionError, StoreError};
pub use models::{QueueItem, QueuedWrite, SyncStatus, TransactionRef};
pub use reconciler::{FlushReport, Reconciler};
pub use session::{Submission, WeighingSession};
pub use store::QueueStore;
pub use sync::SyncHandle;
