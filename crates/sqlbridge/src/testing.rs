//! Testing utilities for sqlbridge
//!
//! An in-memory [`Driver`] whose sessions serve rows from a [`MockTable`], with
//! scripted faults, latency and counters, so the connection lifecycle and the
//! chunked read path can be exercised without a database server.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlbridge::testing::*;
//!
//! #[tokio::test]
//! async fn test_chunk_recovers() {
//!     let driver = MockDriver::new(MockTable::numbered(5000))
//!         .with_fault(Fault::fetch_at(2000, FaultKind::LinkDrop));
//!
//!     let manager = Arc::new(ConnectionManager::new(Arc::new(driver.clone())));
//!     manager.connect(ConnectionConfig::new("mock://db", "sa", "pw")).await.unwrap();
//!
//!     let result = QueryExecutor::new(manager).run_query("SELECT * FROM t").await.unwrap();
//!     assert_eq!(result.row_count(), 5000);
//!     assert_eq!(driver.opens(), 2);
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConnectionConfig;
use crate::connection::{Driver, Session};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

// ============================================================================
// Mock Table
// ============================================================================

/// Rows served by every mock session
#[derive(Debug, Clone, Default)]
pub struct MockTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl MockTable {
    /// Create a table from column names and row values
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// `n` rows of `{id, name}` with `id` running from 1 to `n`
    pub fn numbered(n: u64) -> Self {
        let rows = (1..=n)
            .map(|id| vec![Value::Int(id as i64), Value::String(format!("row-{id}"))])
            .collect();
        Self::new(vec!["id".into(), "name".into()], rows)
    }

    /// Number of rows
    pub fn len(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Check if the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows, as a single sequential read would return them
    pub fn rows(&self) -> Vec<Row> {
        self.slice(0, u64::MAX)
    }

    fn slice(&self, offset: u64, limit: u64) -> Vec<Row> {
        self.rows
            .iter()
            .skip(offset.min(usize::MAX as u64) as usize)
            .take(limit.min(usize::MAX as u64) as usize)
            .map(|values| Row::new(self.columns.clone(), values.clone()))
            .collect()
    }
}

// ============================================================================
// Fault injection
// ============================================================================

/// What an injected fault does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The link drops: the call fails with SQLSTATE `08S01` and the session closes
    LinkDrop,
    /// A transient state error (`HY010`); the session stays open
    Transient,
    /// A non-transient database error (`42S02`)
    Fatal,
}

impl FaultKind {
    fn to_error(self) -> Error {
        match self {
            Self::LinkDrop => Error::driver("08S01", "communication link failure"),
            Self::Transient => Error::driver("HY010", "function sequence error"),
            Self::Fatal => Error::driver("42S02", "invalid object name 'missing_table'"),
        }
    }
}

/// Which session call a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// Row-count probe
    Count,
    /// Range fetch starting at the given offset, or any fetch
    Fetch(Option<u64>),
    /// Mutating statement
    Execute,
}

/// A scripted failure that fires a limited number of times
#[derive(Debug, Clone)]
pub struct Fault {
    target: FaultTarget,
    kind: FaultKind,
    remaining: u32,
}

impl Fault {
    /// Fail the next row-count probe
    pub fn count(kind: FaultKind) -> Self {
        Self::new(FaultTarget::Count, kind)
    }

    /// Fail the next fetch of the range starting at `offset`
    pub fn fetch_at(offset: u64, kind: FaultKind) -> Self {
        Self::new(FaultTarget::Fetch(Some(offset)), kind)
    }

    /// Fail the next fetch of any range
    pub fn any_fetch(kind: FaultKind) -> Self {
        Self::new(FaultTarget::Fetch(None), kind)
    }

    /// Fail the next execute
    pub fn execute(kind: FaultKind) -> Self {
        Self::new(FaultTarget::Execute, kind)
    }

    /// Fire this many times instead of once
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = n;
        self
    }

    fn new(target: FaultTarget, kind: FaultKind) -> Self {
        Self {
            target,
            kind,
            remaining: 1,
        }
    }

    fn matches(&self, target: FaultTarget) -> bool {
        match (self.target, target) {
            (FaultTarget::Fetch(None), FaultTarget::Fetch(_)) => true,
            (expected, actual) => expected == actual,
        }
    }
}

// ============================================================================
// Mock Driver
// ============================================================================

type LatencyFn = dyn Fn(u64) -> Duration + Send + Sync;

/// Tracks how many calls are in flight and the highest value seen.
#[derive(Debug, Default)]
struct Gauge {
    current: AtomicU64,
    peak: AtomicU64,
}

impl Gauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard(self)
    }

    fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

struct GaugeGuard<'a>(&'a Gauge);

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct DriverState {
    table: Mutex<MockTable>,
    faults: Mutex<Vec<Fault>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    fetched: Mutex<Vec<(u64, u64)>>,
    executed: Mutex<Vec<String>>,
    open_delay: Mutex<Duration>,
    fetch_latency: Mutex<Option<Arc<LatencyFn>>>,
    fail_opens: AtomicU32,
    concurrent_cursors: AtomicBool,
    affected_rows: AtomicU64,
    opens: AtomicU64,
    open_gauge: Gauge,
    fetch_gauge: Gauge,
    counts: AtomicU64,
    closes: AtomicU64,
}

impl DriverState {
    /// Consume a matching fault, if any is left
    fn take_fault(&self, target: FaultTarget) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let fault = faults
            .iter_mut()
            .find(|f| f.remaining > 0 && f.matches(target))?;
        fault.remaining -= 1;
        Some(fault.kind)
    }
}

/// A scripted in-memory driver; clones share state
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<DriverState>,
}

impl MockDriver {
    /// Create a driver serving `table`
    pub fn new(table: MockTable) -> Self {
        Self {
            state: Arc::new(DriverState {
                table: Mutex::new(table),
                faults: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                fetched: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
                open_delay: Mutex::new(Duration::ZERO),
                fetch_latency: Mutex::new(None),
                fail_opens: AtomicU32::new(0),
                concurrent_cursors: AtomicBool::new(false),
                affected_rows: AtomicU64::new(1),
                opens: AtomicU64::new(0),
                open_gauge: Gauge::default(),
                fetch_gauge: Gauge::default(),
                counts: AtomicU64::new(0),
                closes: AtomicU64::new(0),
            }),
        }
    }

    /// Delay every session open
    pub fn with_open_delay(self, delay: Duration) -> Self {
        *self.state.open_delay.lock() = delay;
        self
    }

    /// Delay each range fetch by `latency(offset)`
    pub fn with_fetch_latency<F>(self, latency: F) -> Self
    where
        F: Fn(u64) -> Duration + Send + Sync + 'static,
    {
        *self.state.fetch_latency.lock() = Some(Arc::new(latency));
        self
    }

    /// Whether sessions may run several cursors at once
    pub fn with_concurrent_cursors(self, enabled: bool) -> Self {
        self.state.concurrent_cursors.store(enabled, Ordering::SeqCst);
        self
    }

    /// Affected-row count reported by every execute
    pub fn with_affected_rows(self, n: u64) -> Self {
        self.state.affected_rows.store(n, Ordering::SeqCst);
        self
    }

    /// Script a fault
    pub fn with_fault(self, fault: Fault) -> Self {
        self.inject(fault);
        self
    }

    /// Script a fault on a driver that is already in use
    pub fn inject(&self, fault: Fault) {
        self.state.faults.lock().push(fault);
    }

    /// Make the next `n` opens fail with a connection error
    pub fn fail_next_opens(&self, n: u32) {
        self.state.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Drop the link of every open session
    pub fn sever(&self) {
        for session in self.state.sessions.lock().iter() {
            session.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Open attempts so far, failed ones included
    pub fn opens(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Highest number of opens in progress at the same time
    pub fn max_concurrent_opens(&self) -> u64 {
        self.state.open_gauge.peak()
    }

    /// Highest number of range fetches in progress at the same time
    pub fn max_concurrent_fetches(&self) -> u64 {
        self.state.fetch_gauge.peak()
    }

    /// Row-count probes served
    pub fn count_calls(&self) -> u64 {
        self.state.counts.load(Ordering::SeqCst)
    }

    /// Successful range fetches as `(offset, rows returned)`, in completion order
    pub fn fetched_ranges(&self) -> Vec<(u64, u64)> {
        self.state.fetched.lock().clone()
    }

    /// Statements executed successfully
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// Sessions closed through [`Session::close`]
    pub fn closes(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet closed or severed
    pub fn live_sessions(&self) -> usize {
        self.state
            .sessions
            .lock()
            .iter()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .count()
    }
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("rows", &self.state.table.lock().len())
            .field("opens", &self.opens())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn open(&self, _config: &ConnectionConfig) -> Result<Arc<dyn Session>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        let _in_flight = self.state.open_gauge.enter();

        let delay = *self.state.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .state
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::connection("login failed: server unreachable"));
        }

        let session = Arc::new(MockSession {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
            concurrent_cursors: self.state.concurrent_cursors.load(Ordering::SeqCst),
            cursor: tokio::sync::Mutex::new(()),
        });
        self.state.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ============================================================================
// Mock Session
// ============================================================================

/// A session opened by [`MockDriver`]
pub struct MockSession {
    state: Arc<DriverState>,
    closed: AtomicBool,
    concurrent_cursors: bool,
    /// Held for the duration of a call when cursors cannot interleave
    cursor: tokio::sync::Mutex<()>,
}

impl MockSession {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::driver("08003", "connection is closed"));
        }
        Ok(())
    }

    fn check_fault(&self, target: FaultTarget) -> Result<()> {
        match self.state.take_fault(target) {
            Some(kind) => {
                if kind == FaultKind::LinkDrop {
                    self.closed.store(true, Ordering::SeqCst);
                }
                Err(kind.to_error())
            }
            None => Ok(()),
        }
    }

    async fn cursor(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.concurrent_cursors {
            None
        } else {
            Some(self.cursor.lock().await)
        }
    }
}

#[async_trait]
impl Session for MockSession {
    async fn count_rows(&self, _sql: &str) -> Result<u64> {
        let _cursor = self.cursor().await;
        self.check_open()?;
        self.check_fault(FaultTarget::Count)?;

        self.state.counts.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.table.lock().len())
    }

    async fn fetch_rows(&self, _sql: &str, offset: u64, limit: u64) -> Result<Vec<Row>> {
        let _cursor = self.cursor().await;
        let _in_flight = self.state.fetch_gauge.enter();
        self.check_open()?;

        let latency = self.state.fetch_latency.lock().clone();
        if let Some(latency) = latency {
            tokio::time::sleep(latency(offset)).await;
        }

        // a link severed while the fetch was running fails it
        self.check_open()?;
        self.check_fault(FaultTarget::Fetch(Some(offset)))?;

        let rows = self.state.table.lock().slice(offset, limit);
        self.state.fetched.lock().push((offset, rows.len() as u64));
        Ok(rows)
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let _cursor = self.cursor().await;
        self.check_open()?;
        self.check_fault(FaultTarget::Execute)?;

        self.state.executed.lock().push(sql.to_string());
        Ok(self.state.affected_rows.load(Ordering::SeqCst))
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn supports_concurrent_cursors(&self) -> bool {
        self.concurrent_cursors
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
