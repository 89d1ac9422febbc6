//! Operator actions at the scale.
//!
//! Each action tries the server first. Only a delivery failure puts the write in
//! the offline queue; anything the server says back is returned to the operator.

use crate::api::WeighbridgeApi;
use crate::error::SessionError;
use crate::models::{
    CompletePayload, Completion, CreateTransactionPayload, QueuedWrite, RemoteTransaction,
    SyncStatus, TransactionRef,
};
use crate::store::QueueStore;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Outcome of an operator action.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission<T> {
    Sent(T),
    /// Stored locally and replayed by the sync loop.
    Queued { idempotency_key: String },
}

impl<T> Submission<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, Submission::Queued { .. })
    }
}

pub struct WeighingSession {
    api: Arc<dyn WeighbridgeApi>,
    store: Arc<QueueStore>,
}

impl WeighingSession {
    pub fn new(api: Arc<dyn WeighbridgeApi>, store: Arc<QueueStore>) -> Self {
        Self { api, store }
    }

    /// The weighing in progress, if any.
    pub fn active(&self) -> Result<Option<TransactionRef>, SessionError> {
        Ok(self.store.active()?)
    }

    /// Resume a weighing the server already knows about.
    pub fn resume(&self, transaction_id: Uuid) -> Result<(), SessionError> {
        self.store
            .set_active(Some(&TransactionRef::Server { id: transaction_id }))?;
        Ok(())
    }

    /// Start a weighing with the truck's first weight.
    #[instrument(skip(self, payload), fields(first_weight = payload.first_weight))]
    pub async fn record_first_weight(
        &self,
        payload: CreateTransactionPayload,
    ) -> Result<Submission<RemoteTransaction>, SessionError> {
        if let Some(TransactionRef::Server { .. }) = self.store.active()? {
            return Err(SessionError::ActiveTransaction);
        }

        let key = Uuid::new_v4().to_string();
        match self.api.create_transaction(&key, &payload).await {
            Ok(tx) => {
                self.store.record_server_id(&key, tx.id)?;
                self.store
                    .set_active(Some(&TransactionRef::Server { id: tx.id }))?;
                info!(transaction_id = %tx.id, number = %tx.transaction_number, "Weighing started");
                Ok(Submission::Sent(tx))
            }
            Err(e) if e.is_queueable() => {
                warn!(error = %e, idempotency_key = %key, "Server unreachable, queueing first weight");
                self.store
                    .enqueue_create(&key, &QueuedWrite::CreateTx { payload })?;
                Ok(Submission::Queued {
                    idempotency_key: key,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finish the active weighing with the truck's second weight.
    #[instrument(skip(self))]
    pub async fn record_second_weight(
        &self,
        second_weight: f64,
    ) -> Result<Submission<Completion>, SessionError> {
        let active = self.store.active()?.ok_or(SessionError::NoActiveTransaction)?;
        let payload = CompletePayload { second_weight };
        let key = Uuid::new_v4().to_string();

        let id = match active {
            TransactionRef::Server { id } => id,
            TransactionRef::PendingCreate { idempotency_key } => {
                match self.store.server_id_for(&idempotency_key)? {
                    Some(id) => id,
                    // Nothing to send until the create has reached the server.
                    None => {
                        let target = TransactionRef::PendingCreate { idempotency_key };
                        return self.queue_completion(key, target, payload);
                    }
                }
            }
        };

        match self.api.complete_transaction(id, &key, &payload).await {
            Ok(completion) => {
                self.store.set_active(None)?;
                info!(
                    transaction_id = %id,
                    invoice = %completion.invoice.invoice_number,
                    "Weighing completed"
                );
                Ok(Submission::Sent(completion))
            }
            Err(e) if e.is_queueable() => {
                warn!(error = %e, transaction_id = %id, "Server unreachable, queueing second weight");
                self.queue_completion(key, TransactionRef::Server { id }, payload)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn queue_completion(
        &self,
        key: String,
        target: TransactionRef,
        payload: CompletePayload,
    ) -> Result<Submission<Completion>, SessionError> {
        self.store
            .enqueue_complete(&key, &QueuedWrite::CompleteTx { target, payload })?;
        Ok(Submission::Queued {
            idempotency_key: key,
        })
    }

    pub fn status(&self) -> Result<SyncStatus, SessionError> {
        Ok(self.store.sync_status()?)
    }
}
