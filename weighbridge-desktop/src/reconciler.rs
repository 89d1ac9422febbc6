//! Replays the offline queue against the server.
//!
//! Items go out oldest first. A delivery failure stops the flush so a completion
//! is never sent ahead of the create it depends on. Only one flush runs at a
//! time; a flush requested while another is running returns without sending.

use crate::api::WeighbridgeApi;
use crate::error::{ApiError, StoreError};
use crate::models::{QueueItem, QueuedWrite, TransactionRef};
use crate::store::QueueStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Another flush was already running.
    pub skipped: bool,
    pub sent: usize,
    /// Stale creates and orphaned completions removed without sending.
    pub dropped: usize,
    /// Items the server refused, parked for the operator.
    pub rejected: usize,
    /// Set when the flush stopped on a delivery failure.
    pub error: Option<String>,
}

impl FlushReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

enum Step {
    Sent,
    Dropped,
    Rejected,
    Stop(String),
}

pub struct Reconciler {
    store: Arc<QueueStore>,
    api: Arc<dyn WeighbridgeApi>,
    flush_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<QueueStore>, api: Arc<dyn WeighbridgeApi>) -> Self {
        Self {
            store,
            api,
            flush_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            return Ok(FlushReport::skipped());
        };

        let mut report = FlushReport::default();
        for item in self.store.pending()? {
            match self.replay(&item).await? {
                Step::Sent => report.sent += 1,
                Step::Dropped => report.dropped += 1,
                Step::Rejected => report.rejected += 1,
                Step::Stop(error) => {
                    report.error = Some(error);
                    break;
                }
            }
        }

        self.store.record_sync(report.error.as_deref())?;
        if report.sent + report.dropped + report.rejected > 0 || report.error.is_some() {
            info!(
                sent = report.sent,
                dropped = report.dropped,
                rejected = report.rejected,
                error = ?report.error,
                "Offline queue flushed"
            );
        }
        Ok(report)
    }

    async fn replay(&self, item: &QueueItem) -> Result<Step, StoreError> {
        match &item.write {
            QueuedWrite::CreateTx { payload } => {
                // A confirmed weighing superseded this intent, unless the operator
                // already finished it offline.
                if let Some(TransactionRef::Server { id }) = self.store.active()? {
                    if !self.store.has_queued_completion_for(&item.idempotency_key)? {
                        info!(idempotency_key = %item.idempotency_key, active = %id, "Dropping stale queued create");
                        self.store.discard(item.id)?;
                        return Ok(Step::Dropped);
                    }
                }
                match self
                    .api
                    .create_transaction(&item.idempotency_key, payload)
                    .await
                {
                    Ok(tx) => {
                        self.store
                            .acknowledge_create(item.id, &item.idempotency_key, tx.id)?;
                        Ok(Step::Sent)
                    }
                    Err(e) => self.fail(item, e),
                }
            }
            QueuedWrite::CompleteTx { target, payload } => {
                let Some(id) = self.resolve(target)? else {
                    warn!(idempotency_key = %item.idempotency_key, "Dropping completion whose create never reached the server");
                    self.store.discard(item.id)?;
                    return Ok(Step::Dropped);
                };
                match self
                    .api
                    .complete_transaction(id, &item.idempotency_key, payload)
                    .await
                {
                    Ok(_) => {
                        self.store.acknowledge_complete(item.id, id)?;
                        Ok(Step::Sent)
                    }
                    Err(e) => self.fail(item, e),
                }
            }
        }
    }

    fn resolve(&self, target: &TransactionRef) -> Result<Option<Uuid>, StoreError> {
        match target {
            TransactionRef::Server { id } => Ok(Some(*id)),
            TransactionRef::PendingCreate { idempotency_key } => {
                self.store.server_id_for(idempotency_key)
            }
        }
    }

    fn fail(&self, item: &QueueItem, error: ApiError) -> Result<Step, StoreError> {
        let message = error.to_string();
        if error.is_queueable() {
            warn!(idempotency_key = %item.idempotency_key, error = %message, "Queued write not delivered");
            self.store.record_failure(item.id, &message)?;
            Ok(Step::Stop(message))
        } else {
            warn!(idempotency_key = %item.idempotency_key, error = %message, "Server refused queued write");
            self.store.reject(item, &message)?;
            Ok(Step::Rejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::HttpApi;
    use crate::config::DesktopConfig;
    use crate::fake::FakeApi;
    use crate::models::{CompletePayload, CreateTransactionPayload};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload(first_weight: f64) -> CreateTransactionPayload {
        CreateTransactionPayload {
            client_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            transaction_type: "inbound".into(),
            first_weight,
            material_type: None,
            reference_number: None,
            notes: None,
        }
    }

    fn create(first_weight: f64) -> QueuedWrite {
        QueuedWrite::CreateTx {
            payload: payload(first_weight),
        }
    }

    fn complete(target: TransactionRef, second_weight: f64) -> QueuedWrite {
        QueuedWrite::CompleteTx {
            target,
            payload: CompletePayload { second_weight },
        }
    }

    fn pending(key: &str) -> TransactionRef {
        TransactionRef::PendingCreate {
            idempotency_key: key.into(),
        }
    }

    fn setup() -> (Arc<QueueStore>, Arc<FakeApi>, Reconciler) {
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        let api = Arc::new(FakeApi::new());
        let reconciler = Reconciler::new(store.clone(), api.clone());
        (store, api, reconciler)
    }

    #[tokio::test]
    async fn queued_create_converges_to_one_server_transaction() {
        let (store, api, reconciler) = setup();
        store.enqueue_create("k-1", &create(1000.0)).unwrap();

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(api.transaction_count(), 1);

        let server_id = store.server_id_for("k-1").unwrap().unwrap();
        assert_eq!(store.active().unwrap(), Some(TransactionRef::Server { id: server_id }));

        let again = reconciler.flush().await.unwrap();
        assert_eq!(again.sent, 0);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_flushes_send_once() {
        let (store, api, reconciler) = setup();
        store.enqueue_create("k-1", &create(1000.0)).unwrap();
        api.set_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(reconciler.flush(), reconciler.flush());
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.sent + second.sent, 1);
        assert!(first.skipped || second.skipped);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn create_then_completion_replay_in_order() {
        let (store, api, reconciler) = setup();
        store.enqueue_create("k-1", &create(1000.0)).unwrap();
        store.enqueue_complete("c-1", &complete(pending("k-1"), 400.0)).unwrap();

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.sent, 2);

        let server_id = store.server_id_for("k-1").unwrap().unwrap();
        let completion = api.completion_for(server_id).unwrap();
        assert_eq!(completion.transaction.net_weight, Some(600.0));
        assert_eq!(store.active().unwrap(), None);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn flush_stops_at_first_delivery_failure() {
        let (store, api, reconciler) = setup();
        store.enqueue_create("k-1", &create(1000.0)).unwrap();
        store.enqueue_complete("c-1", &complete(pending("k-1"), 400.0)).unwrap();
        api.set_offline(true);

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.sent, 0);
        assert!(report.error.is_some());
        assert_eq!(api.complete_calls.load(Ordering::SeqCst), 0);

        let items = store.pending().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[1].attempts, 0);
        assert!(store.sync_status().unwrap().last_error.is_some());

        api.set_offline(false);
        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.sent, 2);
        assert!(store.sync_status().unwrap().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn stale_create_is_dropped_when_a_weighing_is_confirmed() {
        let (store, api, reconciler) = setup();
        store.enqueue_create("k-1", &create(1000.0)).unwrap();
        let confirmed = Uuid::new_v4();
        store.set_active(Some(&TransactionRef::Server { id: confirmed })).unwrap();

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.active().unwrap(), Some(TransactionRef::Server { id: confirmed }));
    }

    #[tokio::test]
    async fn create_finished_offline_is_sent_despite_a_newer_weighing() {
        let (store, api, reconciler) = setup();
        store.enqueue_create("k-1", &create(1000.0)).unwrap();
        store.enqueue_complete("c-1", &complete(pending("k-1"), 400.0)).unwrap();
        let newer = Uuid::new_v4();
        store.set_active(Some(&TransactionRef::Server { id: newer })).unwrap();

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(api.transaction_count(), 1);
        assert_eq!(store.active().unwrap(), Some(TransactionRef::Server { id: newer }));
    }

    #[tokio::test]
    async fn completion_of_a_dropped_create_is_dropped_as_orphan() {
        let (store, api, reconciler) = setup();
        let create_item = store.enqueue_create("k-1", &create(1000.0)).unwrap();
        store.enqueue_complete("c-1", &complete(pending("k-1"), 400.0)).unwrap();
        store.discard(create_item.id).unwrap();

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(api.complete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn refused_writes_are_parked_and_the_queue_moves_on() {
        let (store, api, reconciler) = setup();
        api.reject_key("k-bad");
        store.enqueue_create("k-bad", &create(1000.0)).unwrap();
        store.enqueue_complete("c-bad", &complete(pending("k-bad"), 400.0)).unwrap();
        let other = api
            .create_transaction("k-direct", &payload(500.0))
            .await
            .unwrap();
        store
            .enqueue_complete("c-ok", &complete(TransactionRef::Server { id: other.id }, 100.0))
            .unwrap();

        let report = reconciler.flush().await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.sent, 1);

        let status = store.sync_status().unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.rejected, 1);
        assert!(api.completion_for(other.id).is_some());
    }

    /// Queue a create and its completion against a server that answers `status`.
    async fn flush_against_failing_server(status: u16, code: &str) -> (Arc<QueueStore>, FlushReport) {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "success": false,
                "error": { "code": code, "message": "try again later" }
            })))
            .mount(&server)
            .await;

        let mut config = DesktopConfig::new(server.uri(), Uuid::new_v4());
        config.request_timeout_secs = 2;
        let api = Arc::new(HttpApi::new(&config).unwrap());
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        store.enqueue_create("k-1", &create(1000.0)).unwrap();
        store.enqueue_complete("c-1", &complete(pending("k-1"), 400.0)).unwrap();

        let report = Reconciler::new(store.clone(), api).flush().await.unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        (store, report)
    }

    fn assert_still_queued(store: &QueueStore, report: &FlushReport) {
        assert_eq!(report.sent, 0);
        assert_eq!(report.rejected, 0);
        assert_eq!(report.dropped, 0);
        assert!(report.error.is_some());

        let status = store.sync_status().unwrap();
        assert_eq!(status.pending, 2);
        assert_eq!(status.rejected, 0);
        let items = store.pending().unwrap();
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[1].attempts, 0);
    }

    #[tokio::test]
    async fn database_errors_keep_the_weighing_queued() {
        let (store, report) = flush_against_failing_server(500, "database_error").await;
        assert_still_queued(&store, &report);
    }

    #[tokio::test]
    async fn request_timeouts_keep_the_weighing_queued() {
        let (store, report) = flush_against_failing_server(408, "request_timeout").await;
        assert_still_queued(&store, &report);
    }

    #[tokio::test]
    async fn rate_limited_writes_stay_queued() {
        let (store, report) = flush_against_failing_server(429, "too_many_requests").await;
        assert_still_queued(&store, &report);
    }
}
