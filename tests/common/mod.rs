//! Shared helpers for integration tests

use blob_courier::{CancellationBroker, Courier, CourierConfig};
use std::sync::Arc;
use tempfile::TempDir;

/// Route `tracing` output through the test harness, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A courier whose cache, data and staging directories live in a fresh temp dir
pub fn courier() -> (Courier, TempDir) {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let courier = Courier::builder()
        .config(CourierConfig::rooted_at(dir.path()))
        .cancellation_broker(Arc::new(CancellationBroker::new()))
        .user_agent("blob-courier-integration-test/1.0")
        .build()
        .unwrap();

    (courier, dir)
}
