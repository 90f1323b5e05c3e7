//! Mutating statements with reconnect-and-retry

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::classify;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;

/// Runs INSERT / UPDATE / DELETE / DDL statements on the managed session.
///
/// A statement that fails with a transient connectivity error is retried on a
/// fresh session. A statement whose link dropped after the server applied it may
/// therefore run twice; callers that cannot tolerate that must make it idempotent.
#[derive(Debug, Clone)]
pub struct WriteExecutor {
    manager: Arc<ConnectionManager>,
    retry: RetryConfig,
}

impl WriteExecutor {
    /// Create an executor with the default retry policy
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self::with_retry(manager, RetryConfig::default())
    }

    /// Create an executor with a custom retry policy
    pub fn with_retry(manager: Arc<ConnectionManager>, retry: RetryConfig) -> Self {
        Self { manager, retry }
    }

    /// Execute `sql` and return the affected row count.
    pub async fn run_update(&self, sql: &str) -> Result<u64> {
        let mut attempt = 0;
        let mut handle = self.manager.ensure_connected(false).await?;

        loop {
            attempt += 1;

            match handle.execute(sql).await {
                Ok(affected) => {
                    debug!(affected, attempt, "Update executed");
                    return Ok(affected);
                }
                Err(e) if classify::is_transient(&e) => {
                    if attempt >= self.retry.max_attempts {
                        error!(attempts = attempt, "Update failed, connection not recovered: {}", e);
                        return Err(Error::retries_exhausted(attempt, e));
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Connection lost during update, reconnecting and retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    handle = self.manager.recover(&handle).await?;
                }
                Err(e) => {
                    let e = e.into_query_error(sql);
                    error!("Update failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::testing::{Fault, FaultKind, MockDriver, MockTable};
    use std::time::Duration;

    async fn executor(driver: &MockDriver) -> (Arc<ConnectionManager>, WriteExecutor) {
        let manager = Arc::new(ConnectionManager::new(Arc::new(driver.clone())));
        manager
            .connect(ConnectionConfig::new("mock://db", "sa", "pw"))
            .await
            .unwrap();
        let executor = WriteExecutor::with_retry(
            Arc::clone(&manager),
            RetryConfig::fixed_delay(3, Duration::from_millis(1)),
        );
        (manager, executor)
    }

    #[tokio::test]
    async fn test_update_returns_affected_rows() {
        let driver = MockDriver::new(MockTable::default()).with_affected_rows(7);
        let (_, executor) = executor(&driver).await;

        assert_eq!(executor.run_update("DELETE FROM t").await.unwrap(), 7);
        assert_eq!(driver.executed(), vec!["DELETE FROM t".to_string()]);
    }

    #[tokio::test]
    async fn test_update_on_severed_connection_reconnects_once() {
        let driver = MockDriver::new(MockTable::default()).with_affected_rows(3);
        let (manager, executor) = executor(&driver).await;

        // the handle still looks open; the failure surfaces on execute
        driver.inject(Fault::execute(FaultKind::LinkDrop));

        assert_eq!(executor.run_update("UPDATE t SET x = 1").await.unwrap(), 3);
        assert_eq!(manager.stats().reconnects, 1);
        assert_eq!(driver.opens(), 2);
        assert_eq!(driver.executed().len(), 1);
    }

    #[tokio::test]
    async fn test_update_after_sever_reconnects_before_executing() {
        let driver = MockDriver::new(MockTable::default()).with_affected_rows(2);
        let (manager, executor) = executor(&driver).await;

        driver.sever();

        assert_eq!(executor.run_update("UPDATE t SET x = 1").await.unwrap(), 2);
        assert_eq!(manager.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_update_retries_exhausted() {
        let driver = MockDriver::new(MockTable::default())
            .with_fault(Fault::execute(FaultKind::LinkDrop).times(5));
        let (_, executor) = executor(&driver).await;

        let err = executor.run_update("UPDATE t SET x = 1").await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(driver.opens(), 3);
    }

    #[tokio::test]
    async fn test_fatal_update_is_not_retried() {
        let driver = MockDriver::new(MockTable::default())
            .with_fault(Fault::execute(FaultKind::Fatal));
        let (manager, executor) = executor(&driver).await;

        let err = executor.run_update("UPDATE missing_table SET x = 1").await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));
        assert_eq!(manager.stats().reconnects, 0);
    }
}
