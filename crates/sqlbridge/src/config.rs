//! Configuration types for sqlbridge
//!
//! - [`ConnectionConfig`]: where and as whom to connect, login timeout
//! - [`ChunkingConfig`]: how a result set is partitioned into chunks
//! - [`RetryConfig`]: how often and how fast transient failures are retried
//! - [`QueryConfig`]: everything the read path needs, including the fetch policy

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

use crate::error::Result;

/// A credential that never shows up in `Debug`, `Display` or logs.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret; only call at the point of use
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***REDACTED***")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "***REDACTED***")
    }
}

impl From<String> for SensitiveString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SensitiveString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Connection settings supplied by `connect`.
///
/// Replaced wholesale on every `connect`; never persisted.
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct ConnectionConfig {
    /// Server address, e.g. `sqlserver://db.local:1433/sales` or the JDBC form
    /// `jdbc:jtds:sqlserver://db.local:1433/sales;instance=SQLEXPRESS`
    #[validate(length(min = 1))]
    pub address: String,

    /// Login name
    #[validate(length(min = 1, max = 128))]
    pub principal: String,

    /// Password
    pub credential: SensitiveString,

    /// Login timeout in seconds (0 = wait indefinitely)
    #[serde(default = "default_login_timeout_secs")]
    #[validate(range(max = 3600))]
    pub login_timeout_secs: u64,
}

fn default_login_timeout_secs() -> u64 {
    30
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("address", &redact_address(&self.address))
            .field("principal", &self.principal)
            .field("credential", &self.credential)
            .field("login_timeout_secs", &self.login_timeout_secs)
            .finish()
    }
}

impl ConnectionConfig {
    /// Create a configuration with the default login timeout
    pub fn new(
        address: impl Into<String>,
        principal: impl Into<String>,
        credential: impl Into<SensitiveString>,
    ) -> Self {
        Self {
            address: address.into(),
            principal: principal.into(),
            credential: credential.into(),
            login_timeout_secs: default_login_timeout_secs(),
        }
    }

    /// Set the login timeout in seconds
    pub fn with_login_timeout_secs(mut self, secs: u64) -> Self {
        self.login_timeout_secs = secs;
        self
    }

    /// Login timeout, `None` when unbounded
    pub fn login_timeout(&self) -> Option<Duration> {
        (self.login_timeout_secs > 0).then(|| Duration::from_secs(self.login_timeout_secs))
    }

    /// Validate field constraints
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }
}

/// Hide a password embedded in the address (URL userinfo or `;password=` property).
fn redact_address(address: &str) -> String {
    let mut parts = address.split(';');
    let head = parts.next().unwrap_or_default();

    let head = match head.find("://") {
        Some(scheme_end) => {
            let rest = &head[scheme_end + 3..];
            match (rest.find('@'), rest.find(':')) {
                (Some(at), Some(colon)) if colon < at => {
                    format!("{}{}:***{}", &head[..scheme_end + 3], &rest[..colon], &rest[at..])
                }
                _ => head.to_string(),
            }
        }
        None => head.to_string(),
    };

    std::iter::once(head)
        .chain(parts.map(|prop| match prop.split_once('=') {
            Some((key, _)) if key.trim().eq_ignore_ascii_case("password") => format!("{key}=***"),
            _ => prop.to_string(),
        }))
        .collect::<Vec<_>>()
        .join(";")
}

/// How a result set is split into row-range chunks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct ChunkingConfig {
    /// Smallest chunk size used regardless of result size
    #[validate(range(min = 1))]
    pub baseline_chunk_size: u64,

    /// Chunk count the planner aims for on large results; also the hard cap
    #[validate(range(min = 1, max = 1024))]
    pub target_chunks: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            baseline_chunk_size: 1000,
            target_chunks: 10,
        }
    }
}

impl ChunkingConfig {
    /// Set the baseline chunk size
    pub fn with_baseline_chunk_size(mut self, size: u64) -> Self {
        self.baseline_chunk_size = size;
        self
    }

    /// Set the target chunk count
    pub fn with_target_chunks(mut self, chunks: u64) -> Self {
        self.target_chunks = chunks;
        self
    }
}

/// Configuration for retrying after transient connectivity failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Set total attempts (at least one)
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set jitter factor
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after `attempt` failed (1-based), before the next one.
    ///
    /// Grows geometrically from `initial_delay` up to `max_delay`. With a jitter factor
    /// the delay is spread by up to that fraction either way, deterministically per
    /// attempt so concurrent callers on different attempts drift apart.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };

        let growth = self.backoff_multiplier.powi(exponent.min(30) as i32);
        let ceiling = self.max_delay.as_secs_f64();
        // NaN and infinity fall back to the ceiling
        let secs = (self.initial_delay.as_secs_f64() * growth).min(ceiling);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay);

        if self.jitter_factor <= 0.0 {
            return delay;
        }

        let spread = (f64::from(attempt) * GOLDEN_RATIO_FRACTION).fract() * 2.0 - 1.0;
        let scale = (1.0 + spread * self.jitter_factor).max(0.0);
        Duration::try_from_secs_f64(delay.as_secs_f64() * scale).unwrap_or(delay)
    }
}

const GOLDEN_RATIO_FRACTION: f64 = 0.618_033_988_749_895;

/// Which session each chunk fetch runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// All chunks run on the single managed session. A session that cannot
    /// multiplex cursors serializes the fetches.
    #[default]
    Shared,
    /// Every in-flight chunk opens its own auxiliary session, closed after use.
    Dedicated,
}

/// Read-path configuration
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// Chunk partitioning
    pub chunking: ChunkingConfig,
    /// Whole-query retry policy
    pub retry: RetryConfig,
    /// Session policy for chunk fetches
    pub fetch_mode: FetchMode,
    /// Upper bound on chunk fetches in flight at once
    pub max_parallel_chunks: usize,
    /// Per-query deadline; in-flight fetches are aborted when it elapses
    pub deadline: Option<Duration>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retry: RetryConfig::default(),
            fetch_mode: FetchMode::Shared,
            max_parallel_chunks: 10,
            deadline: None,
        }
    }
}

impl QueryConfig {
    /// Set chunking parameters
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set fetch mode
    pub fn with_fetch_mode(mut self, mode: FetchMode) -> Self {
        self.fetch_mode = mode;
        self
    }

    /// Set the parallelism bound (at least one)
    pub fn with_max_parallel_chunks(mut self, n: usize) -> Self {
        self.max_parallel_chunks = n.max(1);
        self
    }

    /// Set a per-query deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}
