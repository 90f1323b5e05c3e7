//! # sqlbridge
//!
//! A managed relational database connection with chunked parallel reads and
//! transparent reconnect, exposed through a method-call bridge.
//!
//! ## Features
//!
//! - **Managed Session**: one owned session per bridge, established lazily and
//!   replaced exactly once when its link drops
//! - **Chunked Reads**: result sets are counted, split into row ranges and fetched
//!   concurrently, then reassembled in order
//! - **Transparent Reconnect**: transient link failures (SQLSTATE `08S01`, `08003`,
//!   `08007`, `HY010`) reconnect and retry with bounded exponential backoff
//! - **Method-Call Bridge**: `connectDb`, `queryDatabase`, `updateData`, `disconnect`
//!   with JSON results
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sqlbridge::prelude::*;
//! use std::sync::Arc;
//!
//! let manager = Arc::new(ConnectionManager::new(Arc::new(SqlServerDriver)));
//! manager
//!     .connect(ConnectionConfig::new("jdbc:jtds:sqlserver://db:1433/sales", "reader", "pw"))
//!     .await?;
//!
//! let rows = QueryExecutor::new(Arc::clone(&manager))
//!     .run_query("SELECT * FROM orders")
//!     .await?
//!     .into_rows();
//!
//! let affected = WriteExecutor::new(manager)
//!     .run_update("UPDATE orders SET shipped = 1 WHERE id = 7")
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlserver` (default) - SQL Server support via tiberius

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bridge;
pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod plan;
pub mod query;
pub mod testing;
pub mod types;
pub mod update;

#[cfg(feature = "sqlserver")]
pub mod sqlserver;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, Result};

    // Value and row types
    pub use crate::types::{Row, Value};

    // Configuration
    pub use crate::config::{
        ChunkingConfig, ConnectionConfig, FetchMode, QueryConfig, RetryConfig, SensitiveString,
    };

    // Driver traits and lifecycle
    pub use crate::connection::{Driver, Session};
    pub use crate::manager::{ConnectionManager, ManagerStats, SessionHandle};

    // Read and write paths
    pub use crate::plan::{ChunkPlan, ChunkRange};
    pub use crate::query::{QueryExecutor, QueryResult};
    pub use crate::update::WriteExecutor;

    // Bridge
    pub use crate::bridge::{Bridge, MethodCall, MethodResponse, ResultEncoding, DATABASE_ERROR};

    #[cfg(feature = "sqlserver")]
    pub use crate::sqlserver::{SqlServerAddress, SqlServerDriver};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::{Row, Value};
