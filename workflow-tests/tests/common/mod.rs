//! Common test utilities for workflow integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use weighbridge_desktop::QueueStore;
use workflow_tests::WorkflowTestContext;

/// Spawn the service against `TEST_DATABASE_URL`.
pub async fn setup() -> WorkflowTestContext {
    WorkflowTestContext::spawn()
        .await
        .expect("Failed to start weighbridge-service for workflow test")
}

/// Queue database in a directory removed with the returned guard.
pub fn queue_file() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("station").join("queue.db");
    (dir, path)
}

pub async fn wait_until_drained(store: &QueueStore, timeout: Duration) {
    let start = std::time::Instant::now();
    while store.pending_count().expect("Failed to read queue") > 0 {
        assert!(start.elapsed() < timeout, "offline queue was not drained");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
