//! Error types for the herald-config crate.
//!
//! All store and driver operations return [`ConfigError`] via
//! [`ConfigResult`]. Uses `thiserror` for ergonomic, zero-cost error
//! definitions.
//!
//! The store never retries a failed driver operation internally. A retried
//! `set` after a transport failure could apply a non-idempotent consumer
//! write twice, so retries are left to the caller.

use thiserror::Error;

/// Alias for `Result<T, ConfigError>`.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur in the scoped configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested field has no stored value and no registered default.
    #[error("value not found: {ident}")]
    NotFound { ident: String },

    /// A scope was addressed with a key shape that does not match its
    /// declared schema (wrong custom-group depth, malformed data tree).
    #[error("schema mismatch: {reason}")]
    SchemaMismatch { reason: String },

    /// A value was rejected before any write because it violates a bound
    /// enforced at the call site (e.g. a ledger balance over its maximum).
    #[error("value out of range: {reason}")]
    ValueOutOfRange { reason: String },

    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport failure against the remote document store.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote document store returned an unexpected status or a
    /// malformed response body.
    #[error("backend error: {reason}")]
    Backend { reason: String },

    /// An unrecognized backend name was supplied.
    #[error("unknown backend: `{0}`")]
    UnknownBackend(String),

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for ConfigError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl ConfigError {
    /// Shorthand for a [`ConfigError::Backend`] with a formatted reason.
    pub(crate) fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ConfigError::SchemaMismatch`] with a formatted reason.
    pub(crate) fn schema(reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`ConfigError::ValueOutOfRange`] with a formatted
    /// reason. Public so consumer crates can raise range violations through
    /// the store's taxonomy.
    pub fn out_of_range(reason: impl Into<String>) -> Self {
        Self::ValueOutOfRange {
            reason: reason.into(),
        }
    }

    /// Whether this error is a transient driver I/O failure, as opposed to
    /// a missing value or a schema fault at the call site.
    pub fn is_driver_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Json(_) | Self::Http(_) | Self::Backend { .. } | Self::TaskJoin(_)
        )
    }
}
