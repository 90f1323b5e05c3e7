//! Driver traits for sqlbridge
//!
//! Core abstractions between the engine and a database backend:
//! - Driver: opens sessions from a [`ConnectionConfig`]
//! - Session: one live database session with cursor-style reads
//!
//! Sessions take `&self` everywhere; a backend whose wire protocol cannot interleave
//! cursors guards its client internally and reports
//! [`Session::supports_concurrent_cursors`] as `false`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::types::Row;

/// A live database session
#[async_trait]
pub trait Session: Send + Sync {
    /// Run `sql` on a fresh cursor and scroll to the end, returning the row count
    async fn count_rows(&self, sql: &str) -> Result<u64>;

    /// Run `sql` on a fresh cursor, seek to row `offset` (0-based) and read up to
    /// `limit` rows in result order
    async fn fetch_rows(&self, sql: &str, offset: u64, limit: u64) -> Result<Vec<Row>>;

    /// Read the full result of `sql` on one cursor
    async fn fetch_all(&self, sql: &str) -> Result<Vec<Row>> {
        self.fetch_rows(sql, 0, u64::MAX).await
    }

    /// Execute a mutating statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Whether the session knows its link is gone
    async fn is_closed(&self) -> bool;

    /// Whether several cursors may be open on this session at once
    fn supports_concurrent_cursors(&self) -> bool {
        false
    }

    /// Close the session
    async fn close(&self) -> Result<()>;
}

/// Opens sessions for one database backend
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new session
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn Session>>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}
