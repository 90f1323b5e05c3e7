//! SQL Server backend for sqlbridge
//!
//! Speaks TDS through `tiberius` over a tokio TCP stream.
//!
//! Accepted address forms:
//! - `sqlserver://host[:port][/database][;key=value...]`
//! - `jdbc:jtds:sqlserver://host[:port][/database][;key=value...]`
//! - `jdbc:sqlserver://host[\instance][:port][;databaseName=db...]`
//!
//! Recognized properties: `database`/`databaseName`, `instance`/`instanceName`,
//! `encrypt`, `trustServerCertificate`/`trust_cert`, `applicationName`.
//!
//! A TDS connection carries one active result at a time, so each session guards its
//! client with a mutex and reports no concurrent cursor support. I/O failures are
//! reported with SQLSTATE `08S01` and mark the session closed.
//!
//! TDS has no server-side seek, so a chunk fetch streams the result from its first row
//! and stops reading once its range is full. The unread remainder stays on the wire and
//! `tiberius` drains it before the session's next request, so every chunk transfers the
//! whole result. A chunked read therefore moves roughly `(chunks + 1) × rows` over the
//! network (the count probe included). On SQL Server, [`FetchMode::Shared`] keeps that
//! traffic on one serialized session; [`FetchMode::Dedicated`] multiplies it across
//! parallel logins and only pays off when the server, not the link, is the bottleneck.
//!
//! [`FetchMode::Shared`]: crate::config::FetchMode::Shared
//! [`FetchMode::Dedicated`]: crate::config::FetchMode::Dedicated

use async_trait::async_trait;
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Driver, Session};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

const DEFAULT_PORT: u16 = 1433;
const LINK_FAILURE: &str = "08S01";

/// Where to reach a SQL Server instance, parsed from a connection address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlServerAddress {
    /// Server host name or IP
    pub host: String,
    /// TCP port; `None` when a named instance is resolved through SQL Browser
    pub port: Option<u16>,
    /// Initial database
    pub database: Option<String>,
    /// Named instance
    pub instance: Option<String>,
    /// Remaining `key=value` properties, keys lowercased
    pub properties: BTreeMap<String, String>,
}

impl SqlServerAddress {
    /// Parse a `sqlserver://` or JDBC-style address
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let rest = ["jdbc:jtds:sqlserver://", "jdbc:sqlserver://", "sqlserver://"]
            .iter()
            .find_map(|prefix| strip_prefix_ignore_case(address, prefix))
            .ok_or_else(|| {
                Error::config(format!(
                    "unsupported address '{}': expected sqlserver:// or jdbc:[jtds:]sqlserver://",
                    address.split(';').next().unwrap_or_default()
                ))
            })?;

        let mut segments = rest.split(';');
        let head = segments.next().unwrap_or_default();

        let mut properties = BTreeMap::new();
        for segment in segments.map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                Error::config(format!("malformed address property '{segment}'"))
            })?;
            properties.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        // `host\instance` is not a valid URL authority; lift the instance out first
        let (head, path_instance) = split_instance(head);

        let url = url::Url::parse(&format!("sqlserver://{head}"))
            .map_err(|e| Error::config(format!("invalid SQL Server address: {e}")))?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config("SQL Server address has no host"))?
            .to_string();

        let instance = path_instance
            .or_else(|| properties.remove("instance"))
            .or_else(|| properties.remove("instancename"))
            .filter(|i| !i.is_empty());

        let port = match (url.port(), properties.remove("port")) {
            (Some(port), _) => Some(port),
            (None, Some(port)) => Some(
                port.parse()
                    .map_err(|_| Error::config(format!("invalid port '{port}'")))?,
            ),
            (None, None) if instance.is_some() => None,
            (None, None) => Some(DEFAULT_PORT),
        };

        let database = Some(url.path().trim_matches('/').to_string())
            .filter(|db| !db.is_empty())
            .or_else(|| properties.remove("databasename"))
            .or_else(|| properties.remove("database"));

        Ok(Self {
            host,
            port,
            database,
            instance,
            properties,
        })
    }

    fn flag(&self, keys: &[&str]) -> Option<bool> {
        keys.iter()
            .find_map(|key| self.properties.get(*key))
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
    }

    /// Build a `tiberius` configuration for `principal`/`credential`
    fn to_tiberius(&self, principal: &str, credential: &str) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        if let Some(port) = self.port {
            config.port(port);
        }
        if let Some(instance) = &self.instance {
            config.instance_name(instance);
        }
        if let Some(database) = &self.database {
            config.database(database);
        }
        config.application_name(
            self.properties
                .get("applicationname")
                .map(String::as_str)
                .unwrap_or("sqlbridge"),
        );
        config.authentication(AuthMethod::sql_server(principal, credential));

        match self.flag(&["encrypt"]) {
            Some(true) => config.encryption(EncryptionLevel::Required),
            Some(false) => config.encryption(EncryptionLevel::NotSupported),
            None => {}
        }
        if self
            .flag(&["trustservercertificate", "trust_cert"])
            .unwrap_or(false)
        {
            config.trust_cert();
        }
        config
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Split `host\instance[:port][/db]` into `host[:port][/db]` and the instance name
fn split_instance(head: &str) -> (String, Option<String>) {
    let Some(slash) = head.find('\\') else {
        return (head.to_string(), None);
    };

    let after = &head[slash + 1..];
    let end = after.find([':', '/']).unwrap_or(after.len());
    let instance = after[..end].to_string();
    (format!("{}{}", &head[..slash], &after[end..]), Some(instance))
}

/// Map a `tiberius` failure onto the crate error, tagging link failures with `08S01`
fn map_tiberius_error(err: tiberius::error::Error) -> Error {
    use tiberius::error::Error as TdsError;

    match err {
        TdsError::Io { kind, message } => Error::Driver {
            sql_state: Some(LINK_FAILURE.to_string()),
            code: None,
            message: format!("communication link failure ({kind:?}): {message}"),
        },
        TdsError::Server(token) => Error::Driver {
            sql_state: None,
            code: Some(token.code()),
            message: token.message().to_string(),
        },
        TdsError::Conversion(message) | TdsError::Encoding(message) => {
            Error::type_conversion(message.to_string())
        }
        other => Error::Driver {
            sql_state: None,
            code: None,
            message: other.to_string(),
        },
    }
}

/// Convert a tiberius column value to a [`Value`]
fn tiberius_to_value(row: &tiberius::Row, idx: usize) -> Value {
    // probe typed columns before raw bytes so BIT does not come back as Bytes
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Value::Int(i64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::Int(i64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::Int(i64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::Int(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Value::Float(f64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Value::Float(v);
    }
    if let Ok(Some(v)) = row.try_get::<rust_decimal::Decimal, _>(idx) {
        return Value::Decimal(v);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
        return Value::Uuid(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx) {
        return Value::DateTimeTz(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return Value::DateTime(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDate, _>(idx) {
        return Value::Date(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveTime, _>(idx) {
        return Value::Time(v);
    }
    if let Ok(Some(bytes)) = row.try_get::<&[u8], _>(idx) {
        return Value::Bytes(bytes.to_vec());
    }

    Value::Null
}

fn tiberius_row_to_row(tib_row: &tiberius::Row) -> Row {
    let columns: Vec<String> = tib_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = (0..columns.len())
        .map(|i| tiberius_to_value(tib_row, i))
        .collect();

    Row::new(columns, values)
}

type TdsClient = Client<Compat<TcpStream>>;

/// One TDS session
pub struct SqlServerSession {
    client: Mutex<Option<TdsClient>>,
    closed: AtomicBool,
}

impl SqlServerSession {
    fn new(client: TdsClient) -> Self {
        Self {
            client: Mutex::new(Some(client)),
            closed: AtomicBool::new(false),
        }
    }

    /// Map a driver failure, marking the session closed when the link is gone
    fn fail(&self, err: tiberius::error::Error) -> Error {
        let err = map_tiberius_error(err);
        if err.sql_state() == Some(LINK_FAILURE) {
            self.closed.store(true, Ordering::SeqCst);
        }
        err
    }
}

fn session_closed() -> Error {
    Error::driver("08003", "session is closed")
}

#[async_trait]
impl Session for SqlServerSession {
    async fn count_rows(&self, sql: &str) -> Result<u64> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(session_closed)?;

        let counted = async {
            let mut rows = client.simple_query(sql).await?.into_row_stream();
            let mut total = 0u64;
            while rows.try_next().await?.is_some() {
                total += 1;
            }
            Ok::<_, tiberius::error::Error>(total)
        }
        .await;

        counted.map_err(|e| self.fail(e))
    }

    async fn fetch_rows(&self, sql: &str, offset: u64, limit: u64) -> Result<Vec<Row>> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(session_closed)?;

        let fetched = async {
            let mut stream = client.simple_query(sql).await?.into_row_stream();
            let mut rows = Vec::with_capacity(limit.min(4096) as usize);
            let mut skipped = 0u64;

            // rows past the range are left unread; the client drains them on its next request
            while (rows.len() as u64) < limit {
                let Some(row) = stream.try_next().await? else {
                    break;
                };
                if skipped < offset {
                    skipped += 1;
                } else {
                    rows.push(tiberius_row_to_row(&row));
                }
            }
            Ok::<_, tiberius::error::Error>(rows)
        }
        .await;

        fetched.map_err(|e| self.fail(e))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut guard = self.client.lock().await;
        let client = guard.as_mut().ok_or_else(session_closed)?;

        match client.execute(sql, &[]).await {
            Ok(result) => Ok(result.total()),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let client = self.client.lock().await.take();
        match client {
            Some(client) => client.close().await.map_err(map_tiberius_error),
            None => Ok(()),
        }
    }
}

/// Opens [`SqlServerSession`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDriver;

impl SqlServerDriver {
    async fn connect_tcp(config: &Config, address: &SqlServerAddress) -> Result<TcpStream> {
        let tcp = if address.instance.is_some() && address.port.is_none() {
            TcpStream::connect_named(config)
                .await
                .map_err(|e| Error::connection(format!("failed to resolve named instance: {e}")))?
        } else {
            TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| Error::connection_with_source("failed to reach server", e))?
        };
        tcp.set_nodelay(true).ok();
        Ok(tcp)
    }
}

#[async_trait]
impl Driver for SqlServerDriver {
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<dyn Session>> {
        let address = SqlServerAddress::parse(&config.address)?;
        let mut tds = address.to_tiberius(&config.principal, config.credential.expose_secret());

        let tcp = Self::connect_tcp(&tds, &address).await?;
        let client = match Client::connect(tds.clone(), tcp.compat_write()).await {
            Ok(client) => client,
            // Azure gateways redirect the login to the actual node
            Err(tiberius::error::Error::Routing { host, port }) => {
                debug!(%host, port, "Login redirected");
                tds.host(&host);
                tds.port(port);
                let tcp = TcpStream::connect(tds.get_addr())
                    .await
                    .map_err(|e| Error::connection_with_source("failed to reach redirected server", e))?;
                tcp.set_nodelay(true).ok();
                Client::connect(tds, tcp.compat_write())
                    .await
                    .map_err(|e| Error::connection(format!("failed to authenticate: {e}")))?
            }
            Err(e) => {
                warn!(host = %address.host, "SQL Server login failed: {}", e);
                return Err(Error::connection(format!("failed to authenticate: {e}")));
            }
        };

        Ok(Arc::new(SqlServerSession::new(client)))
    }

    fn name(&self) -> &'static str {
        "sqlserver"
    }
}
