//! Method-call bridge
//!
//! Exposes the engine to a host that speaks in named method calls with a map of
//! arguments and expects one reply per call:
//!
//! | Method          | Arguments                                        | Success result                  |
//! |-----------------|--------------------------------------------------|---------------------------------|
//! | `connectDb`     | `url`, `username`, `password`, `timeoutInSeconds` | `true`                          |
//! | `queryDatabase` | `query`                                          | rows, per [`ResultEncoding`]    |
//! | `updateData`    | `query`                                          | string `{"affectedRows":n}`     |
//! | `disconnect`    |                                                  | `true`                          |
//!
//! Every failure is reported as [`MethodResponse::Error`] with code
//! [`DATABASE_ERROR`]; unknown methods get [`MethodResponse::NotImplemented`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{ConnectionConfig, QueryConfig, RetryConfig};
use crate::connection::Driver;
use crate::error::{Error, Result};
use crate::manager::ConnectionManager;
use crate::query::{QueryExecutor, QueryResult};
use crate::update::WriteExecutor;

/// Error code carried by every failed call
pub const DATABASE_ERROR: &str = "DATABASE_ERROR";

/// A named call with its arguments
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MethodCall {
    /// Method name
    pub method: String,
    /// Named arguments
    #[serde(default)]
    pub arguments: Map<String, Json>,
}

impl MethodCall {
    /// Create a call without arguments
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            arguments: Map::new(),
        }
    }

    /// Add an argument
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Json>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    fn string_arg(&self, name: &str) -> Result<&str> {
        match self.arguments.get(name) {
            Some(Json::String(s)) => Ok(s),
            Some(other) => Err(Error::config(format!(
                "argument '{name}' must be a string, got {other}"
            ))),
            None => Err(Error::config(format!("missing argument '{name}'"))),
        }
    }

    /// Non-negative integer, given as a number or numeric string
    fn u64_arg(&self, name: &str) -> Result<Option<u64>> {
        let invalid = || Error::config(format!("argument '{name}' must be a non-negative integer"));

        match self.arguments.get(name) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::Number(n)) => n.as_u64().map(Some).ok_or_else(invalid),
            Some(Json::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid()),
            Some(_) => Err(invalid()),
        }
    }
}

/// Reply to a [`MethodCall`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MethodResponse {
    /// The call succeeded
    Success {
        /// Method result
        result: Json,
    },
    /// The call failed
    Error {
        /// Always [`DATABASE_ERROR`]
        code: String,
        /// Human-readable failure description
        message: String,
    },
    /// The method is unknown
    NotImplemented,
}

impl MethodResponse {
    /// Successful reply
    pub fn success(result: impl Into<Json>) -> Self {
        Self::Success {
            result: result.into(),
        }
    }

    /// Failed reply for `error`
    pub fn database_error(error: &Error) -> Self {
        Self::Error {
            code: DATABASE_ERROR.to_string(),
            message: error.to_string(),
        }
    }

    /// Check if the call succeeded
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Result value of a successful reply
    pub fn result(&self) -> Option<&Json> {
        match self {
            Self::Success { result } => Some(result),
            _ => None,
        }
    }
}

/// Shape of a `queryDatabase` result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultEncoding {
    /// One JSON array of row objects
    #[default]
    Array,
    /// One string per chunk: the chunk's compact JSON array without its outer
    /// brackets. Callers rebuild the result as `"[" + fragments.join(",") + "]"`,
    /// skipping empty fragments.
    Fragments,
}

impl ResultEncoding {
    /// Render a query result
    pub fn encode(self, result: QueryResult) -> Result<Json> {
        match self {
            Self::Array => serde_json::to_value(result.into_rows())
                .map_err(|e| Error::internal(format!("failed to encode rows: {e}"))),
            Self::Fragments => result
                .into_chunks()
                .iter()
                .map(|chunk| {
                    let encoded = serde_json::to_string(chunk)
                        .map_err(|e| Error::internal(format!("failed to encode rows: {e}")))?;
                    Ok(Json::String(strip_brackets(&encoded).to_string()))
                })
                .collect::<Result<Vec<_>>>()
                .map(Json::Array),
        }
    }
}

fn strip_brackets(array: &str) -> &str {
    array
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(array)
}

/// Routes method calls to the engine
#[derive(Clone)]
pub struct Bridge {
    manager: Arc<ConnectionManager>,
    queries: QueryExecutor,
    writes: WriteExecutor,
    encoding: ResultEncoding,
    runtime: Handle,
}

impl Bridge {
    /// Create a bridge over `driver` whose calls run on `runtime`
    pub fn new(driver: Arc<dyn Driver>, runtime: Handle) -> Self {
        let manager = Arc::new(ConnectionManager::new(driver));
        Self {
            queries: QueryExecutor::new(Arc::clone(&manager)),
            writes: WriteExecutor::new(Arc::clone(&manager)),
            manager,
            encoding: ResultEncoding::default(),
            runtime,
        }
    }

    /// Set the read-path configuration
    pub fn with_query_config(mut self, config: QueryConfig) -> Result<Self> {
        self.queries = QueryExecutor::with_config(Arc::clone(&self.manager), config)?;
        Ok(self)
    }

    /// Set the retry policy for updates
    pub fn with_update_retry(mut self, retry: RetryConfig) -> Self {
        self.writes = WriteExecutor::with_retry(Arc::clone(&self.manager), retry);
        self
    }

    /// Set the `queryDatabase` result encoding
    pub fn with_encoding(mut self, encoding: ResultEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// The connection manager behind this bridge
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run `call` on the bridge runtime and hand the reply to `reply`.
    ///
    /// Returns immediately; the caller's thread never waits on the database.
    pub fn dispatch<F>(&self, call: MethodCall, reply: F) -> JoinHandle<()>
    where
        F: FnOnce(MethodResponse) + Send + 'static,
    {
        let bridge = self.clone();
        self.runtime.spawn(async move {
            let response = bridge.handle(call).await;
            reply(response);
        })
    }

    /// Run `call` and return its reply.
    pub async fn handle(&self, call: MethodCall) -> MethodResponse {
        debug!(method = %call.method, "Handling method call");

        let outcome = match call.method.as_str() {
            "connectDb" => self.connect_db(&call).await,
            "queryDatabase" => self.query_database(&call).await,
            "updateData" => self.update_data(&call).await,
            "disconnect" => self.disconnect().await,
            other => {
                debug!(method = other, "Unknown method");
                return MethodResponse::NotImplemented;
            }
        };

        match outcome {
            Ok(result) => MethodResponse::success(result),
            Err(e) => {
                error!(method = %call.method, "Method call failed: {}", e);
                MethodResponse::database_error(&e)
            }
        }
    }

    /// Close the managed session when the host detaches.
    pub async fn shutdown(&self) {
        if let Err(e) = self.manager.disconnect().await {
            error!("Error closing session on shutdown: {}", e);
        }
        info!("Bridge shut down");
    }

    async fn connect_db(&self, call: &MethodCall) -> Result<Json> {
        let mut config = ConnectionConfig::new(
            call.string_arg("url")?,
            call.string_arg("username")?,
            call.string_arg("password")?,
        );
        if let Some(secs) = call.u64_arg("timeoutInSeconds")? {
            config = config.with_login_timeout_secs(secs);
        }

        self.manager.connect(config).await?;
        Ok(Json::Bool(true))
    }

    async fn query_database(&self, call: &MethodCall) -> Result<Json> {
        let sql = call.string_arg("query")?;
        let result = self.queries.run_query(sql).await?;
        self.encoding.encode(result)
    }

    async fn update_data(&self, call: &MethodCall) -> Result<Json> {
        let sql = call.string_arg("query")?;
        let affected = self.writes.run_update(sql).await?;
        Ok(Json::String(
            serde_json::json!({ "affectedRows": affected }).to_string(),
        ))
    }

    async fn disconnect(&self) -> Result<Json> {
        self.manager.disconnect().await?;
        Ok(Json::Bool(true))
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("manager", &self.manager)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}
