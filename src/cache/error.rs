//! Error types for the cache layer.

use std::io;

use thiserror::Error;

use crate::http::StatusCode;

/// Errors from parsing or querying a `Cache-Control` directive set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    /// A quoted string was never closed, or a value had no directive name.
    #[error("malformed Cache-Control at byte {position}: {input:?}")]
    Malformed { input: String, position: usize },

    /// A directive value is not a non-negative integer number of seconds.
    #[error("directive {name} is not a number: {value:?}")]
    NotANumber { name: String, value: String },

    /// The directive is not present.
    #[error("directive {0} is not present")]
    Missing(String),
}

/// Errors from reading typed values out of a header map.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header {0} is not present")]
    Missing(String),

    #[error("header {name} is not an integer: {value:?}")]
    NotAnInteger { name: String, value: String },

    #[error("header {name} is not an HTTP-date: {value:?}")]
    NotADate { name: String, value: String },
}

/// Errors from freshness and age calculations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FreshnessError {
    /// The resource carries neither `max-age`, `s-maxage` nor `Expires`.
    #[error("resource has no expiration information")]
    NoExpirationInfo,

    /// Neither `Proxy-Date` nor `Date` is available to anchor the age.
    #[error("unable to calculate age: no Date or Proxy-Date header")]
    NoDate,

    #[error(transparent)]
    Directive(#[from] DirectiveError),
}

/// Errors reported by a [`Store`](super::Store) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No resource is stored under the key.
    #[error("key not found in cache: {0}")]
    NotFound(String),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record could not be decoded.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Returns `true` for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors observed by the consumer side of a capture stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// The body outgrew the configured capture limit and was discarded.
    #[error("captured body exceeded {limit} bytes")]
    Overflow { limit: usize },

    /// Forwarding to the client failed, so the captured body may be truncated.
    #[error("forwarding to client failed: {0}")]
    Forward(String),
}

/// Request-level cache failures.
///
/// Only [`MalformedRequest`](Self::MalformedRequest),
/// [`LookupFailure`](Self::LookupFailure) and
/// [`OnlyIfCachedMiss`](Self::OnlyIfCachedMiss) ever reach a client; the
/// other variants are logged and the request degrades to an uncached pass-through.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid request: {0}")]
    MalformedRequest(String),

    #[error("lookup error: {0}")]
    LookupFailure(#[source] StoreError),

    #[error("key not in cache")]
    OnlyIfCachedMiss,

    #[error("capture failed: {0}")]
    CaptureFailure(#[from] CaptureError),

    #[error("storing resources {keys:?} failed: {source}")]
    StoreFailure {
        keys: Vec<String>,
        #[source]
        source: StoreError,
    },
}

impl CacheError {
    /// The status written to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) => StatusCode::BadRequest,
            Self::OnlyIfCachedMiss => StatusCode::GatewayTimeout,
            Self::LookupFailure(_) | Self::CaptureFailure(_) | Self::StoreFailure { .. } => {
                StatusCode::InternalServerError
            }
        }
    }
}

impl From<DirectiveError> for CacheError {
    fn from(err: DirectiveError) -> Self {
        Self::MalformedRequest(err.to_string())
    }
}
