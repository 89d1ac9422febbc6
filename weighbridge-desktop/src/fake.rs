//! In-process stand-in for the server, with the same idempotency rules.

use crate::api::WeighbridgeApi;
use crate::error::ApiError;
use crate::models::{
    CompletePayload, Completion, CreateTransactionPayload, RemoteInvoice, RemoteTransaction,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct FakeApi {
    offline: AtomicBool,
    pub create_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    /// Create keys the server refuses.
    rejected_keys: Mutex<Vec<String>>,
    by_key: Mutex<HashMap<String, RemoteTransaction>>,
    completions: Mutex<HashMap<Uuid, Completion>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn reject_key(&self, key: &str) {
        self.rejected_keys.lock().unwrap().push(key.to_string());
    }

    pub fn transaction_count(&self) -> usize {
        self.by_key.lock().unwrap().len()
    }

    pub fn completion_for(&self, id: Uuid) -> Option<Completion> {
        self.completions.lock().unwrap().get(&id).cloned()
    }

    async fn gate(&self) -> Result<(), ApiError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(ApiError::Transport("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WeighbridgeApi for FakeApi {
    async fn create_transaction(
        &self,
        idempotency_key: &str,
        payload: &CreateTransactionPayload,
    ) -> Result<RemoteTransaction, ApiError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        if self.rejected_keys.lock().unwrap().iter().any(|k| k == idempotency_key) {
            return Err(ApiError::Rejected {
                status: 404,
                code: "not_found".into(),
                message: "Client not found".into(),
            });
        }

        let mut by_key = self.by_key.lock().unwrap();
        let tx = by_key
            .entry(idempotency_key.to_string())
            .or_insert_with(|| RemoteTransaction {
                id: Uuid::new_v4(),
                transaction_number: format!("TST-{}", idempotency_key),
                status: "pending".into(),
                first_weight: payload.first_weight,
                second_weight: None,
                net_weight: None,
                client_request_id: Some(idempotency_key.to_string()),
            });
        Ok(tx.clone())
    }

    async fn complete_transaction(
        &self,
        transaction_id: Uuid,
        _idempotency_key: &str,
        payload: &CompletePayload,
    ) -> Result<Completion, ApiError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let mut by_key = self.by_key.lock().unwrap();
        let tx = by_key
            .values_mut()
            .find(|t| t.id == transaction_id)
            .ok_or_else(|| ApiError::Rejected {
                status: 404,
                code: "not_found".into(),
                message: format!("Transaction {transaction_id} not found"),
            })?;

        let mut completions = self.completions.lock().unwrap();
        if let Some(existing) = completions.get(&transaction_id) {
            return Ok(existing.clone());
        }

        let net = (tx.first_weight - payload.second_weight).abs();
        tx.status = "completed".into();
        tx.second_weight = Some(payload.second_weight);
        tx.net_weight = Some(net);
        let completion = Completion {
            transaction: tx.clone(),
            invoice: RemoteInvoice {
                id: Uuid::new_v4(),
                invoice_number: format!("INV-{}", tx.transaction_number),
                total_amount: net,
                balance: net,
                status: "sent".into(),
            },
        };
        completions.insert(transaction_id, completion.clone());
        Ok(completion)
    }

    async fn health(&self) -> Result<(), ApiError> {
        self.gate().await
    }
}
