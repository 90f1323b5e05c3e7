//! Connection lifecycle management
//!
//! [`ConnectionManager`] owns the one live database session. Every operation goes
//! through [`ConnectionManager::ensure_connected`] before touching the database, which
//! makes (re)connection lazy:
//!
//! - no handle yet, or the handle reports itself closed → establish
//! - `force` → establish, unless another caller already replaced the handle
//! - otherwise → no-op
//!
//! Establishing is mutually exclusive. Each installed handle carries a generation;
//! a caller that saw generation `n` fail only reconnects if `n` is still installed,
//! so a burst of failures on one session produces exactly one new session.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlbridge::prelude::*;
//!
//! let manager = ConnectionManager::new(Arc::new(SqlServerDriver));
//! manager.connect(ConnectionConfig::new("sqlserver://db/sales", "reader", "pw")).await?;
//! let handle = manager.ensure_connected(false).await?;
//! let n = handle.count_rows("SELECT * FROM orders").await?;
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Driver, Session};
use crate::error::{Error, Result};

/// A cheap, cloneable reference to an installed session and its generation
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<dyn Session>,
    generation: u64,
}

impl SessionHandle {
    /// Generation of this handle; strictly increasing across establishes
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The underlying session
    #[inline]
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

impl Deref for SessionHandle {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Lifecycle statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Sessions installed as the managed handle
    pub sessions_established: u64,
    /// Establishes triggered by a failed or closed handle
    pub reconnects: u64,
    /// Handles closed by `disconnect`
    pub disconnects: u64,
    /// Failed attempts to open a session
    pub establish_failures: u64,
    /// Auxiliary sessions opened for dedicated chunk fetches
    pub dedicated_sessions: u64,
}

/// Atomic lifecycle stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicManagerStats {
    pub sessions_established: AtomicU64,
    pub reconnects: AtomicU64,
    pub disconnects: AtomicU64,
    pub establish_failures: AtomicU64,
    pub dedicated_sessions: AtomicU64,
}

impl AtomicManagerStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    fn record_established(&self) {
        self.sessions_established.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn record_establish_failure(&self) {
        self.establish_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dedicated(&self) {
        self.dedicated_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> ManagerStats {
        ManagerStats {
            sessions_established: self.sessions_established.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            establish_failures: self.establish_failures.load(Ordering::Relaxed),
            dedicated_sessions: self.dedicated_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Owner of the single managed database session
pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    config: RwLock<Option<Arc<ConnectionConfig>>>,
    current: RwLock<Option<SessionHandle>>,
    /// Serializes establish, connect and disconnect
    establish_lock: Mutex<()>,
    last_generation: AtomicU64,
    stats: AtomicManagerStats,
}

impl ConnectionManager {
    /// Create a manager for `driver`; nothing is opened until [`connect`](Self::connect)
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            config: RwLock::new(None),
            current: RwLock::new(None),
            establish_lock: Mutex::new(()),
            last_generation: AtomicU64::new(0),
            stats: AtomicManagerStats::new(),
        }
    }

    /// Store `config`, tear down any existing session and establish a new one.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<SessionHandle> {
        let config = Arc::new(config.validated()?);
        let _guard = self.establish_lock.lock().await;

        *self.config.write() = Some(Arc::clone(&config));

        let previous = self.current.write().take();
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "Tearing down existing session before connect");
            if let Err(e) = previous.close().await {
                warn!("Error closing previous session: {}", e);
            }
        }

        self.establish_locked(&config).await
    }

    /// Return a usable handle, establishing one when there is none, when the
    /// current one reports itself closed, or when `force` is set.
    pub async fn ensure_connected(&self, force: bool) -> Result<SessionHandle> {
        let observed = self.current.read().clone();

        match observed {
            Some(handle) => {
                if !force && !handle.is_closed().await {
                    return Ok(handle);
                }
                self.recover(&handle).await
            }
            None => self.establish_if_absent().await,
        }
    }

    /// Replace `stale` with a fresh session, unless another caller already did.
    ///
    /// Callers pass the handle they saw fail; concurrent callers holding the same
    /// generation wait on the first one and then share its new session.
    pub async fn recover(&self, stale: &SessionHandle) -> Result<SessionHandle> {
        let _guard = self.establish_lock.lock().await;

        let current = self.current.read().clone();
        if let Some(current) = current {
            if current.generation != stale.generation {
                debug!(
                    stale = stale.generation,
                    current = current.generation,
                    "Session already replaced, reusing it"
                );
                return Ok(current);
            }
        }

        let config = self.stored_config()?;
        self.stats.record_reconnect();
        info!(stale = stale.generation, "Connection lost. Reconnecting...");
        self.establish_locked(&config).await
    }

    /// Open a new session with the stored configuration and install it.
    ///
    /// On failure the prior handle, if any, is left in place.
    pub async fn establish(&self) -> Result<SessionHandle> {
        let _guard = self.establish_lock.lock().await;
        let config = self.stored_config()?;
        self.establish_locked(&config).await
    }

    /// Close the current session. Idempotent; the stored configuration is kept so
    /// a later operation reconnects lazily.
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.establish_lock.lock().await;

        let handle = self.current.write().take();
        let Some(handle) = handle else {
            debug!("Disconnect requested with no active session");
            return Ok(());
        };

        self.stats.record_disconnect();
        match handle.close().await {
            Ok(()) => {
                info!(generation = handle.generation, "Disconnected from the database");
                Ok(())
            }
            Err(e) => {
                error!("Error disconnecting from the database: {}", e);
                Err(e)
            }
        }
    }

    /// The installed handle, without any liveness check.
    pub fn current_handle(&self) -> Result<SessionHandle> {
        self.current.read().clone().ok_or(Error::NotConnected)
    }

    /// Open an auxiliary session with the stored configuration.
    ///
    /// The session is not installed; the caller owns it and must close it.
    pub async fn open_dedicated(&self) -> Result<Arc<dyn Session>> {
        let config = self.stored_config()?;
        let session = self.open_session(&config).await?;
        self.stats.record_dedicated();
        debug!("Opened dedicated session");
        Ok(session)
    }

    /// Whether a handle is installed and reports itself open
    pub async fn is_connected(&self) -> bool {
        let current = self.current.read().clone();
        match current {
            Some(handle) => !handle.is_closed().await,
            None => false,
        }
    }

    /// Lifecycle statistics
    pub fn stats(&self) -> ManagerStats {
        self.stats.snapshot()
    }

    async fn establish_if_absent(&self) -> Result<SessionHandle> {
        let _guard = self.establish_lock.lock().await;

        // another caller may have established while we waited
        let current = self.current.read().clone();
        if let Some(current) = current {
            if !current.is_closed().await {
                return Ok(current);
            }
        }

        let config = self.stored_config()?;
        self.establish_locked(&config).await
    }

    fn stored_config(&self) -> Result<Arc<ConnectionConfig>> {
        self.config.read().clone().ok_or(Error::NotConnected)
    }

    async fn open_session(&self, config: &ConnectionConfig) -> Result<Arc<dyn Session>> {
        let open = self.driver.open(config);
        let opened = match config.login_timeout() {
            Some(limit) => match tokio::time::timeout(limit, open).await {
                Ok(result) => result,
                Err(_) => Err(Error::connection(format!(
                    "login timed out after {}s",
                    limit.as_secs()
                ))),
            },
            None => open.await,
        };

        opened.map_err(|e| {
            self.stats.record_establish_failure();
            match e {
                Error::Connection { .. } => e,
                other => Error::connection_with_source("failed to open session", other),
            }
        })
    }

    /// Caller must hold `establish_lock`.
    async fn establish_locked(&self, config: &ConnectionConfig) -> Result<SessionHandle> {
        info!(driver = self.driver.name(), "Establishing database connection...");

        let session = match self.open_session(config).await {
            Ok(session) => session,
            Err(e) => {
                error!("Error establishing database connection: {}", e);
                return Err(e);
            }
        };

        let handle = SessionHandle {
            session,
            generation: self.last_generation.fetch_add(1, Ordering::AcqRel) + 1,
        };

        let replaced = self.current.write().replace(handle.clone());
        self.stats.record_established();
        info!(generation = handle.generation, "Database connection established successfully");

        if let Some(replaced) = replaced {
            if let Err(e) = replaced.close().await {
                debug!(generation = replaced.generation, "Closing replaced session failed: {}", e);
            }
        }

        Ok(handle)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("driver", &self.driver.name())
            .field("config", &*self.config.read())
            .field("generation", &self.last_generation.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDriver, MockTable};
    use std::time::Duration;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new("mock://db", "sa", "pw")
    }

    fn manager(driver: &MockDriver) -> ConnectionManager {
        ConnectionManager::new(Arc::new(driver.clone()))
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail_not_connected() {
        let driver = MockDriver::new(MockTable::numbered(3));
        let manager = manager(&driver);

        assert!(matches!(manager.current_handle(), Err(Error::NotConnected)));
        assert!(matches!(
            manager.ensure_connected(false).await,
            Err(Error::NotConnected)
        ));
        assert_eq!(driver.opens(), 0);
    }

    #[tokio::test]
    async fn test_ensure_connected_is_noop_when_open() {
        let driver = MockDriver::new(MockTable::numbered(3));
        let manager = manager(&driver);

        let first = manager.connect(config()).await.unwrap();
        let second = manager.ensure_connected(false).await.unwrap();

        assert_eq!(first.generation(), second.generation());
        assert_eq!(driver.opens(), 1);
    }

    #[tokio::test]
    async fn test_ensure_connected_reconnects_when_closed_or_forced() {
        let driver = MockDriver::new(MockTable::numbered(3));
        let manager = manager(&driver);

        let first = manager.connect(config()).await.unwrap();
        driver.sever();
        let second = manager.ensure_connected(false).await.unwrap();
        assert!(second.generation() > first.generation());

        let third = manager.ensure_connected(true).await.unwrap();
        assert!(third.generation() > second.generation());
        assert_eq!(driver.opens(), 3);
        assert_eq!(manager.stats().reconnects, 2);
    }

    #[tokio::test]
    async fn test_connect_replaces_existing_session() {
        let driver = MockDriver::new(MockTable::numbered(3));
        let manager = manager(&driver);

        let first = manager.connect(config()).await.unwrap();
        let second = manager.connect(config()).await.unwrap();

        assert_ne!(first.generation(), second.generation());
        assert!(first.is_closed().await);
        assert!(!second.is_closed().await);
    }

    #[tokio::test]
    async fn test_failed_establish_leaves_prior_handle() {
        let driver = MockDriver::new(MockTable::numbered(3));
        let manager = manager(&driver);

        let first = manager.connect(config()).await.unwrap();
        driver.fail_next_opens(1);

        assert!(matches!(
            manager.establish().await,
            Err(Error::Connection { .. })
        ));
        assert_eq!(manager.current_handle().unwrap().generation(), first.generation());
        assert_eq!(manager.stats().establish_failures, 1);
    }

    #[tokio::test]
    async fn test_login_timeout_fails_with_connection_error() {
        let driver = MockDriver::new(MockTable::numbered(1)).with_open_delay(Duration::from_secs(5));
        let manager = manager(&driver);

        tokio::time::pause();
        let result = manager
            .connect(config().with_login_timeout_secs(1))
            .await;
        assert!(matches!(result, Err(Error::Connection { .. })));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_reconnects_lazily() {
        let driver = MockDriver::new(MockTable::numbered(3));
        let manager = manager(&driver);

        manager.connect(config()).await.unwrap();
        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();

        assert!(matches!(manager.current_handle(), Err(Error::NotConnected)));
        assert!(!manager.is_connected().await);

        manager.ensure_connected(false).await.unwrap();
        assert!(manager.is_connected().await);
        assert_eq!(manager.stats().disconnects, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recover_collapses_to_one_establish() {
        let driver = MockDriver::new(MockTable::numbered(3))
            .with_open_delay(Duration::from_millis(50));
        let manager = Arc::new(manager(&driver));

        let stale = manager.connect(config()).await.unwrap();
        driver.sever();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let stale = stale.clone();
                tokio::spawn(async move { manager.recover(&stale).await })
            })
            .collect();

        let mut generations = Vec::new();
        for task in tasks {
            generations.push(task.await.unwrap().unwrap().generation());
        }

        assert!(generations.iter().all(|g| *g == generations[0]));
        assert_eq!(driver.opens(), 2);
        assert_eq!(driver.max_concurrent_opens(), 1);
    }
}
