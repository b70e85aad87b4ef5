//! Error types shared across the merger

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a merge query.
///
/// Per-index failures are not errors at this level: they travel through the
/// merge as `QueueItem::Error` and are delivered to the caller's callback,
/// which decides whether the query keeps going.
#[derive(Debug, Error)]
pub enum Error {
    /// A database, design document, or view named by the request does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The resolved design document revision differs from the requested one
    #[error("design document revision mismatch")]
    RevisionMismatch,

    /// Revision drift persisted across every retry attempt
    #[error("design document revision did not settle after {0} attempts")]
    RevisionSyncFailed(u32),

    /// A backing set-view no longer covers the requested partitions
    #[error("set view outdated")]
    SetViewOutdated,

    /// The merge queue was shut down while a producer was blocked on it
    #[error("merge queue shut down")]
    QueueShutdown,

    /// The watchdog or connection timeout fired
    #[error("operation timed out")]
    Timeout,

    /// HTTP transport failure talking to a remote merge endpoint
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Callback-originated failure; aborts the merge with this message
    #[error("{0}")]
    Callback(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Create an HTTP transport error
    pub fn http(msg: impl Into<String>) -> Self {
        Error::Http(msg.into())
    }
}
