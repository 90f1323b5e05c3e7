//! Integration tests for sqlbridge updates

use sqlbridge::prelude::*;
use sqlbridge::testing::{Fault, FaultKind, MockDriver, MockTable};
use std::sync::Arc;
use std::time::Duration;

async fn setup(driver: &MockDriver) -> (Arc<ConnectionManager>, WriteExecutor) {
    let manager = Arc::new(ConnectionManager::new(Arc::new(driver.clone())));
    manager
        .connect(ConnectionConfig::new("mock://db", "writer", "secret"))
        .await
        .unwrap();
    let writes = WriteExecutor::with_retry(
        Arc::clone(&manager),
        RetryConfig::fixed_delay(3, Duration::from_millis(1)),
    );
    (manager, writes)
}

#[tokio::test]
async fn test_update_before_connect_fails() {
    let driver = MockDriver::new(MockTable::default());
    let manager = Arc::new(ConnectionManager::new(Arc::new(driver)));

    let err = WriteExecutor::new(manager)
        .run_update("DELETE FROM t")
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotConnected);
}

#[tokio::test]
async fn test_severed_update_reconnects_once_and_reports_count() {
    let driver = MockDriver::new(MockTable::default()).with_affected_rows(12);
    let (manager, writes) = setup(&driver).await;
    driver.inject(Fault::execute(FaultKind::LinkDrop));

    let affected = writes.run_update("UPDATE orders SET shipped = 1").await.unwrap();

    assert_eq!(affected, 12);
    assert_eq!(manager.stats().reconnects, 1);
    assert_eq!(driver.executed(), vec!["UPDATE orders SET shipped = 1".to_string()]);
}

#[tokio::test]
async fn test_transient_state_error_retries_on_fresh_session() {
    let driver = MockDriver::new(MockTable::default()).with_affected_rows(1);
    let (manager, writes) = setup(&driver).await;
    driver.inject(Fault::execute(FaultKind::Transient));

    assert_eq!(writes.run_update("INSERT INTO t VALUES (1)").await.unwrap(), 1);
    assert_eq!(manager.stats().reconnects, 1);
}

#[tokio::test]
async fn test_exhausted_update_is_connection_error() {
    let driver = MockDriver::new(MockTable::default());
    let (manager, writes) = setup(&driver).await;
    driver.inject(Fault::execute(FaultKind::LinkDrop).times(3));

    let err = writes.run_update("UPDATE t SET x = 1").await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(driver.executed().is_empty());
    assert_eq!(manager.stats().reconnects, 2);
}

#[tokio::test]
async fn test_reconnect_failure_surfaces_connection_error() {
    let driver = MockDriver::new(MockTable::default());
    let (_, writes) = setup(&driver).await;
    driver.inject(Fault::execute(FaultKind::LinkDrop));
    driver.fail_next_opens(1);

    let err = writes.run_update("UPDATE t SET x = 1").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
}
