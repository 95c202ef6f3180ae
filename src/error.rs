//! Error Handling and Retry Logic
//!
//! Typed errors for every replication surface, their recovery categories, and
//! the retry helper used when (re)connecting to a relay.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Errors surfaced by the synchronization core.
///
/// Concurrent read-modify-write or whole-snapshot overwrites that discard a
/// peer's change are not errors and never show up here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("transport error on {path}: {message}")]
    Transport { path: String, message: String },

    #[error("relational engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("malformed snapshot: {0}")]
    SnapshotDecode(String),

    #[error("key \"{0}\" is not an array")]
    ArrayType(String),

    #[error("key \"{0}\" is not a number")]
    NumberType(String),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("room is read-only")]
    ReadOnly,

    #[error("document \"{0}\" already exists")]
    DocumentExists(String),

    #[error("document \"{0}\" not found")]
    DocumentNotFound(String),

    #[error("\"{0}\" cannot be used as a document name")]
    InvalidDocumentName(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn transport(path: impl ToString, message: impl ToString) -> Self {
        SyncError::Transport {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    /// Recovery category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Transport { .. } => ErrorCategory::Network,
            SyncError::EngineUnavailable(_) => ErrorCategory::Engine,
            SyncError::SnapshotDecode(_) => ErrorCategory::Snapshot,
            SyncError::ArrayType(_)
            | SyncError::NumberType(_)
            | SyncError::Sql(_)
            | SyncError::DocumentExists(_)
            | SyncError::DocumentNotFound(_)
            | SyncError::InvalidDocumentName(_) => ErrorCategory::Validation,
            SyncError::ReadOnly => ErrorCategory::ReadOnly,
            SyncError::Config(_) => ErrorCategory::Configuration,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Categorized error kinds for recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Replication transport failures (retried on the next user action)
    Network,

    /// The embedded SQL engine is gone for this session
    Engine,

    /// A replicated snapshot could not be decoded
    Snapshot,

    /// Caller supplied something the operation cannot work with
    Validation,

    /// Mutation attempted in a view-only room
    ReadOnly,

    /// Configuration errors (not retryable)
    Configuration,
}

impl ErrorCategory {
    /// Check if this error category is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Network)
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Execute an async operation with retry logic
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    let mut delay = policy.initial_delay;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempts >= policy.max_attempts {
                    return Err(e);
                }

                tracing::warn!(
                    "attempt {}/{} failed: {}. retrying in {:?}",
                    attempts,
                    policy.max_attempts,
                    e,
                    delay
                );

                sleep(delay).await;

                // Exponential backoff
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_multiplier)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }
}
