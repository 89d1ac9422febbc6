//! Background flushing of the offline queue.
//!
//! Flushes on start, on every interval tick while items remain, and whenever the
//! station reports that the network came back.

use crate::reconciler::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct SyncHandle {
    wake: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Start the loop on the current runtime.
    pub fn spawn(reconciler: Arc<Reconciler>, interval: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run(reconciler, interval, wake.clone(), cancel.clone()));
        Self { wake, cancel, task }
    }

    /// The network is reachable again.
    pub fn notify_online(&self) {
        self.wake.notify_one();
    }

    /// Operator pressed "sync now".
    pub fn sync_now(&self) {
        self.wake.notify_one();
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sync loop ended abnormally");
        }
    }
}

async fn run(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    wake: Arc<Notify>,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "Sync loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately, which gives the start-up flush.
    let mut forced = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => forced = true,
        }

        if !forced {
            match reconciler.store().pending_count() {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Could not read offline queue");
                    continue;
                }
            }
        }
        forced = false;

        match reconciler.flush().await {
            Ok(report) if report.skipped => debug!("Flush already in progress"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Offline queue flush failed"),
        }
    }
    info!("Sync loop stopped");
}
