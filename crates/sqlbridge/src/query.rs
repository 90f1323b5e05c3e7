//! Chunked parallel reads
//!
//! [`QueryExecutor::run_query`] probes the row count, plans row-range chunks with
//! [`ChunkPlan`] and fetches them concurrently, reassembling the chunks in range order.
//!
//! Failure handling:
//! - a transient failure inside one chunk reconnects and retries that chunk once
//! - a transient failure that survives the chunk retry restarts the whole query,
//!   bounded by [`RetryConfig`](crate::config::RetryConfig)
//! - any other failure cancels the in-flight chunks and surfaces as [`Error::Query`]
//!
//! No partial result is ever returned. Only a failure of the managed session itself
//! (the count probe, or a chunk in [`FetchMode::Shared`]) replaces that session; a
//! dedicated chunk session that fails is simply discarded.

use std::ops::Deref;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::classify;
use crate::config::{FetchMode, QueryConfig};
use crate::connection::Session;
use crate::error::{Error, Result};
use crate::manager::{ConnectionManager, SessionHandle};
use crate::plan::{ChunkPlan, ChunkRange};
use crate::types::Row;

/// Rows of one query, kept per chunk in range order
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    plan: ChunkPlan,
    chunks: Vec<Vec<Row>>,
}

impl QueryResult {
    /// The plan the rows were fetched with
    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    /// Rows grouped by chunk; `chunks()[i]` holds range `i`
    pub fn chunks(&self) -> &[Vec<Row>] {
        &self.chunks
    }

    /// Total number of rows
    pub fn row_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Iterate over all rows in result order
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.chunks.iter().flatten()
    }

    /// All rows in result order
    pub fn into_rows(self) -> Vec<Row> {
        self.chunks.into_iter().flatten().collect()
    }

    /// Rows grouped by chunk
    pub fn into_chunks(self) -> Vec<Vec<Row>> {
        self.chunks
    }
}

/// Runs read queries as concurrent chunk fetches
#[derive(Clone)]
pub struct QueryExecutor {
    manager: Arc<ConnectionManager>,
    config: Arc<QueryConfig>,
}

impl QueryExecutor {
    /// Create an executor with the default [`QueryConfig`]
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            config: Arc::new(QueryConfig::default()),
        }
    }

    /// Create an executor with a custom configuration
    pub fn with_config(manager: Arc<ConnectionManager>, config: QueryConfig) -> Result<Self> {
        config.chunking.validate()?;
        Ok(Self {
            manager,
            config: Arc::new(config),
        })
    }

    /// The executor's configuration
    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Run `sql` and return every row in result order.
    pub async fn run_query(&self, sql: &str) -> Result<QueryResult> {
        let sql: Arc<str> = Arc::from(sql);

        match self.config.deadline {
            Some(limit) => match tokio::time::timeout(limit, self.run_with_retry(&sql)).await {
                Ok(result) => result,
                Err(_) => {
                    error!(deadline_ms = limit.as_millis() as u64, "Query deadline elapsed");
                    Err(Error::timeout(format!(
                        "query did not complete within {}ms",
                        limit.as_millis()
                    )))
                }
            },
            None => self.run_with_retry(&sql).await,
        }
    }

    /// Fetch one range on `handle` (or on a dedicated session, per the fetch mode).
    ///
    /// A transient failure reconnects and retries the range once before surfacing.
    pub async fn fetch_chunk(
        &self,
        handle: &SessionHandle,
        sql: &str,
        range: ChunkRange,
    ) -> Result<Vec<Row>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        match self.fetch_once(handle, sql, range).await {
            Err(e) if classify::is_transient(&e) => {
                warn!(
                    chunk = range.index,
                    start = range.start,
                    "Transient failure fetching chunk, retrying once: {}",
                    e
                );
                let handle = match self.config.fetch_mode {
                    FetchMode::Shared => self.manager.recover(handle).await?,
                    FetchMode::Dedicated => handle.clone(),
                };
                self.fetch_once(&handle, sql, range).await
            }
            other => other,
        }
    }

    async fn run_with_retry(&self, sql: &Arc<str>) -> Result<QueryResult> {
        let retry = &self.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let handle = self.manager.ensure_connected(false).await?;

            match self.run_once(&handle, sql).await {
                Ok(result) => {
                    debug!(
                        rows = result.row_count(),
                        chunks = result.chunks.len(),
                        attempt,
                        "Query completed"
                    );
                    return Ok(result);
                }
                Err(AttemptError { error: e, on_managed }) if classify::is_transient(&e) => {
                    if attempt >= retry.max_attempts {
                        error!(attempts = attempt, "Query failed, connection not recovered: {}", e);
                        return Err(Error::retries_exhausted(attempt, e));
                    }

                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Connection lost during query, reconnecting and retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    if on_managed {
                        self.manager.recover(&handle).await?;
                    }
                }
                Err(AttemptError { error: e, .. }) => {
                    let e = e.into_query_error(sql);
                    error!("Query failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn run_once(
        &self,
        handle: &SessionHandle,
        sql: &Arc<str>,
    ) -> std::result::Result<QueryResult, AttemptError> {
        let total_rows = handle
            .count_rows(sql)
            .await
            .map_err(|error| AttemptError::new(error, true))?;
        let plan = ChunkPlan::new(total_rows, &self.config.chunking);

        info!(
            rows = total_rows,
            chunk_size = plan.chunk_size(),
            chunks = plan.len(),
            "Fetching query result in chunks"
        );

        if total_rows == 0 {
            return Ok(QueryResult {
                chunks: vec![Vec::new(); plan.len()],
                plan,
            });
        }

        let permits = match self.config.fetch_mode {
            FetchMode::Shared if !handle.supports_concurrent_cursors() => 1,
            _ => self.config.max_parallel_chunks.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut tasks = JoinSet::new();
        for range in plan.ranges().iter().copied() {
            let this = self.clone();
            let handle = handle.clone();
            let sql = Arc::clone(sql);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::internal("chunk semaphore closed"))?;
                let rows = this.fetch_chunk(&handle, &sql, range).await?;
                debug!(chunk = range.index, rows = rows.len(), "Chunk fetched");
                Ok::<_, Error>((range.index, rows))
            });
        }

        let on_managed = self.config.fetch_mode == FetchMode::Shared;
        let mut chunks: Vec<Option<Vec<Row>>> = vec![None; plan.len()];
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| Error::internal(format!("chunk task failed: {e}")))
                .and_then(|fetched| fetched);

            match outcome {
                Ok((index, rows)) => chunks[index] = Some(rows),
                Err(e) => {
                    // wait for the aborted tasks so their sessions are released
                    tasks.shutdown().await;
                    return Err(AttemptError::new(e, on_managed));
                }
            }
        }

        let chunks = chunks
            .into_iter()
            .enumerate()
            .map(|(i, rows)| rows.ok_or_else(|| Error::internal(format!("chunk {i} missing"))))
            .collect::<Result<Vec<_>>>()
            .map_err(|error| AttemptError::new(error, false))?;

        Ok(QueryResult { plan, chunks })
    }

    async fn fetch_once(
        &self,
        handle: &SessionHandle,
        sql: &str,
        range: ChunkRange,
    ) -> Result<Vec<Row>> {
        match self.config.fetch_mode {
            FetchMode::Shared => handle.fetch_rows(sql, range.start, range.len).await,
            FetchMode::Dedicated => {
                let session = self.manager.open_dedicated().await?;
                let session = DedicatedSession::new(session, range.index);
                let rows = session.fetch_rows(sql, range.start, range.len).await;
                session.release().await;
                rows
            }
        }
    }
}

/// A failed attempt, tagged with whether the managed session is the one that failed
struct AttemptError {
    error: Error,
    on_managed: bool,
}

impl AttemptError {
    fn new(error: Error, on_managed: bool) -> Self {
        Self { error, on_managed }
    }
}

/// Per-chunk session that gets closed even if its task is aborted mid-fetch.
///
/// [`release`](Self::release) closes it in place; dropping it unreleased hands the
/// close to a background task on the current runtime.
struct DedicatedSession {
    session: Arc<dyn Session>,
    chunk: usize,
    released: bool,
}

impl DedicatedSession {
    fn new(session: Arc<dyn Session>, chunk: usize) -> Self {
        Self {
            session,
            chunk,
            released: false,
        }
    }

    async fn release(mut self) {
        if let Err(e) = self.session.close().await {
            debug!(chunk = self.chunk, "Closing dedicated session failed: {}", e);
        }
        self.released = true;
    }
}

impl Deref for DedicatedSession {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for DedicatedSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let session = Arc::clone(&self.session);
        let chunk = self.chunk;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!(chunk, "Closing abandoned dedicated session failed: {}", e);
                    }
                });
            }
            Err(_) => warn!(chunk, "Dedicated session dropped outside a runtime, left open"),
        }
    }
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkingConfig, ConnectionConfig, RetryConfig};
    use crate::testing::{Fault, FaultKind, MockDriver, MockTable};
    use std::time::Duration;

    async fn connected(driver: &MockDriver) -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(Arc::new(driver.clone())));
        manager
            .connect(ConnectionConfig::new("mock://db", "sa", "pw"))
            .await
            .unwrap();
        manager
    }

    fn fast_retry() -> QueryConfig {
        QueryConfig::default().with_retry(RetryConfig::fixed_delay(3, Duration::from_millis(1)))
    }

    /// Abandoned dedicated sessions close on background tasks; give them a moment
    async fn settle_sessions(driver: &MockDriver, expected: usize) {
        for _ in 0..200 {
            if driver.live_sessions() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_query_before_connect_fails() {
        let driver = MockDriver::new(MockTable::numbered(10));
        let manager = Arc::new(ConnectionManager::new(Arc::new(driver)));

        let result = QueryExecutor::new(manager).run_query("SELECT 1").await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_small_result_single_chunk() {
        let driver = MockDriver::new(MockTable::numbered(500));
        let executor = QueryExecutor::new(connected(&driver).await);

        let result = executor.run_query("SELECT * FROM t").await.unwrap();
        assert_eq!(result.plan().len(), 1);

        let sequential = executor
            .manager
            .current_handle()
            .unwrap()
            .fetch_all("SELECT * FROM t")
            .await
            .unwrap();
        assert_eq!(result.into_rows(), sequential);
    }

    #[tokio::test]
    async fn test_empty_result() {
        let driver = MockDriver::new(MockTable::numbered(0));
        let executor = QueryExecutor::new(connected(&driver).await);

        let result = executor.run_query("SELECT * FROM t").await.unwrap();
        assert_eq!(result.row_count(), 0);
        assert_eq!(result.chunks().len(), 1);
        assert!(driver.fetched_ranges().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_order_preserved_when_chunks_finish_out_of_order() {
        // later ranges finish first
        let driver = MockDriver::new(MockTable::numbered(12_345))
            .with_concurrent_cursors(true)
            .with_fetch_latency(|offset| Duration::from_millis(40 - offset / 1000 * 3));
        let executor = QueryExecutor::new(connected(&driver).await);

        let result = executor.run_query("SELECT * FROM t").await.unwrap();

        assert_eq!(result.plan().chunk_size(), 1234);
        assert_eq!(result.chunks().len(), 10);
        assert_eq!(result.into_rows(), MockTable::numbered(12_345).rows());
        let first_done = driver.fetched_ranges()[0].0;
        assert_ne!(first_done, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_session_without_cursor_support_serializes() {
        let driver = MockDriver::new(MockTable::numbered(5000))
            .with_fetch_latency(|_| Duration::from_millis(2));
        let executor = QueryExecutor::new(connected(&driver).await);

        let result = executor.run_query("SELECT * FROM t").await.unwrap();
        assert_eq!(result.row_count(), 5000);
        assert_eq!(driver.max_concurrent_fetches(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dedicated_mode_opens_session_per_chunk() {
        let driver = MockDriver::new(MockTable::numbered(50_000))
            .with_fetch_latency(|_| Duration::from_millis(20));
        let manager = connected(&driver).await;
        let config = QueryConfig::default()
            .with_fetch_mode(FetchMode::Dedicated)
            .with_max_parallel_chunks(4);
        let executor = QueryExecutor::with_config(Arc::clone(&manager), config).unwrap();

        let result = executor.run_query("SELECT * FROM t").await.unwrap();

        assert_eq!(result.into_rows(), MockTable::numbered(50_000).rows());
        assert_eq!(manager.stats().dedicated_sessions, 10);
        assert_eq!(driver.opens(), 11);
        assert!(driver.max_concurrent_fetches() > 1);
        assert!(driver.max_concurrent_fetches() <= 4);
        // only the managed session stays open
        assert_eq!(driver.live_sessions(), 1);
        assert_eq!(driver.closes(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dedicated_sessions_closed_when_deadline_elapses() {
        let driver = MockDriver::new(MockTable::numbered(50_000))
            .with_fetch_latency(|_| Duration::from_secs(60));
        let manager = connected(&driver).await;
        let config = QueryConfig::default()
            .with_fetch_mode(FetchMode::Dedicated)
            .with_deadline(Duration::from_millis(100));
        let executor = QueryExecutor::with_config(Arc::clone(&manager), config).unwrap();

        let err = executor.run_query("SELECT * FROM t").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        settle_sessions(&driver, 1).await;
        assert_eq!(driver.live_sessions(), 1);
        assert!(manager.stats().dedicated_sessions > 0);
        assert_eq!(driver.closes(), manager.stats().dedicated_sessions);
        assert!(manager.is_connected().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dedicated_sessions_closed_after_fatal_chunk() {
        let driver = MockDriver::new(MockTable::numbered(50_000))
            .with_fetch_latency(|offset| {
                if offset == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(500)
                }
            })
            .with_fault(Fault::fetch_at(0, FaultKind::Fatal));
        let manager = connected(&driver).await;
        let config = QueryConfig::default().with_fetch_mode(FetchMode::Dedicated);
        let executor = QueryExecutor::with_config(Arc::clone(&manager), config).unwrap();

        let err = executor.run_query("SELECT * FROM missing_table").await.unwrap_err();
        assert!(matches!(err, Error::Query { .. }));

        settle_sessions(&driver, 1).await;
        assert_eq!(driver.live_sessions(), 1);
        assert_eq!(driver.closes(), manager.stats().dedicated_sessions);
        assert!(driver.fetched_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_dedicated_chunk_link_drop_keeps_managed_session() {
        let driver = MockDriver::new(MockTable::numbered(5000))
            .with_fault(Fault::fetch_at(2000, FaultKind::LinkDrop).times(2));
        let manager = connected(&driver).await;
        let config = fast_retry().with_fetch_mode(FetchMode::Dedicated);
        let executor = QueryExecutor::with_config(Arc::clone(&manager), config).unwrap();

        let rows = executor.run_query("SELECT * FROM t").await.unwrap().into_rows();

        let handle = manager.current_handle().unwrap();
        assert_eq!(rows, handle.fetch_all("SELECT * FROM t").await.unwrap());
        assert_eq!(handle.generation(), 1);
        assert_eq!(manager.stats().reconnects, 0);
        assert_eq!(driver.count_calls(), 2);
        settle_sessions(&driver, 1).await;
        assert_eq!(driver.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_link_drop_in_chunk_recovers_without_duplication() {
        let driver = MockDriver::new(MockTable::numbered(5000))
            .with_fault(Fault::fetch_at(2000, FaultKind::LinkDrop));
        let manager = connected(&driver).await;
        let executor = QueryExecutor::with_config(Arc::clone(&manager), fast_retry()).unwrap();

        let result = executor.run_query("SELECT * FROM t").await.unwrap();

        assert_eq!(result.into_rows(), MockTable::numbered(5000).rows());
        assert_eq!(manager.stats().reconnects, 1);
        assert_eq!(driver.opens(), 2);
        assert_eq!(driver.count_calls(), 1);
    }

    #[tokio::test]
    async fn test_chunk_retry_failure_restarts_query() {
        let driver = MockDriver::new(MockTable::numbered(3000))
            .with_fault(Fault::fetch_at(1000, FaultKind::Transient).times(2));
        let manager = connected(&driver).await;
        let executor = QueryExecutor::with_config(Arc::clone(&manager), fast_retry()).unwrap();

        let result = executor.run_query("SELECT * FROM t").await.unwrap();

        assert_eq!(result.into_rows(), MockTable::numbered(3000).rows());
        assert_eq!(driver.count_calls(), 2);
    }

    #[tokio::test]
    async fn test_fatal_chunk_failure_returns_query_error() {
        let driver = MockDriver::new(MockTable::numbered(5000))
            .with_fault(Fault::fetch_at(3000, FaultKind::Fatal));
        let executor = QueryExecutor::new(connected(&driver).await);

        let err = executor.run_query("SELECT * FROM missing_table").await.unwrap_err();

        match err {
            Error::Query { sql_state, sql, .. } => {
                assert_eq!(sql_state.as_deref(), Some("42S02"));
                assert_eq!(sql.as_deref(), Some("SELECT * FROM missing_table"));
            }
            other => panic!("expected query error, got {other:?}"),
        }
        assert_eq!(driver.opens(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_connection_error() {
        let driver = MockDriver::new(MockTable::numbered(10))
            .with_fault(Fault::count(FaultKind::LinkDrop).times(10));
        let manager = connected(&driver).await;
        let executor = QueryExecutor::with_config(Arc::clone(&manager), fast_retry()).unwrap();

        let err = executor.run_query("SELECT * FROM t").await.unwrap_err();

        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(driver.count_calls(), 0);
        assert_eq!(manager.stats().reconnects, 2);
    }

    #[tokio::test]
    async fn test_deadline_aborts_query() {
        let driver = MockDriver::new(MockTable::numbered(5000))
            .with_fetch_latency(|_| Duration::from_secs(60));
        let config = QueryConfig::default().with_deadline(Duration::from_millis(50));
        let executor = QueryExecutor::with_config(connected(&driver).await, config).unwrap();

        let err = executor.run_query("SELECT * FROM t").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(driver.fetched_ranges().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_chunking_rejected() {
        let driver = MockDriver::new(MockTable::numbered(1));
        let manager = Arc::new(ConnectionManager::new(Arc::new(driver)));
        let config = QueryConfig::default()
            .with_chunking(ChunkingConfig::default().with_target_chunks(0));

        assert!(matches!(
            QueryExecutor::with_config(manager, config),
            Err(Error::Configuration { .. })
        ));
    }
}
