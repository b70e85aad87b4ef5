//! Error types for the change-stream client

use thiserror::Error;

use crate::frame::{
    STATUS_ERANGE, STATUS_KEY_EEXISTS, STATUS_KEY_NOT_FOUND, STATUS_NOT_MY_VBUCKET,
    STATUS_SASL_AUTH_FAILED,
};

/// Result type alias using [`StreamError`]
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors specific to frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough bytes for a header; callers should buffer more
    #[error("incomplete frame: need at least {0} bytes")]
    Incomplete(usize),

    /// Neither the request nor the response magic byte
    #[error("invalid magic byte: 0x{0:02x}")]
    InvalidMagic(u8),

    /// Opcode this decoder does not know
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Body shorter than the opcode's layout demands
    #[error("truncated body for opcode 0x{opcode:02x} ({len} bytes)")]
    TruncatedBody { opcode: u8, len: usize },

    /// A textual field was not valid UTF-8
    #[error("invalid UTF-8 in frame")]
    InvalidUtf8,
}

/// Errors surfaced by the stream client.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The server rejected the SASL handshake
    #[error("SASL authentication failed")]
    SaslAuthFailed,

    /// The partition version sent with a stream request is unknown to the
    /// server
    #[error("wrong partition version")]
    WrongPartitionVersion,

    /// The requested start sequence lies outside the server's range
    #[error("wrong start sequence number")]
    WrongStartSequenceNumber,

    /// A stream for this partition is already active
    #[error("partition stream already exists")]
    VbucketStreamAlreadyExists,

    /// No active stream for this partition (or request id)
    #[error("partition stream not found")]
    VbucketStreamNotFound,

    /// The server does not own this partition
    #[error("not my vbucket")]
    NotMyVbucket,

    /// The failover log exceeds the configured maximum
    #[error("failover log too large ({0} entries)")]
    TooLargeFailoverLog(usize),

    /// The server returned an empty failover log
    #[error("no failover log found")]
    NoFailoverLogFound,

    /// A status code with no dedicated mapping
    #[error("server status 0x{0:02x}")]
    ServerStatus(u16),

    /// A reply decoded cleanly but does not carry what the request asked
    /// for; the connection itself is still usable
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The connection is gone; carries the terminating reason
    #[error("connection closed: {0}")]
    Closed(String),

    /// Frame codec failure
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect or handshake timeout
    #[error("operation timed out")]
    Timeout,
}

/// Map a non-success status code to the error a caller should see.
///
/// `NOT_MY_VBUCKET` is context-dependent: on stream-close and stream
/// lookups it means the stream is gone, on stats it means the server does
/// not own the partition. This is the stream-context mapping; stats
/// callers use [`status_error_stats`].
pub fn status_error(status: u16) -> StreamError {
    match status {
        STATUS_KEY_NOT_FOUND => StreamError::WrongPartitionVersion,
        STATUS_ERANGE => StreamError::WrongStartSequenceNumber,
        STATUS_KEY_EEXISTS => StreamError::VbucketStreamAlreadyExists,
        STATUS_NOT_MY_VBUCKET => StreamError::VbucketStreamNotFound,
        STATUS_SASL_AUTH_FAILED => StreamError::SaslAuthFailed,
        other => StreamError::ServerStatus(other),
    }
}

/// Status mapping for stats responses.
pub fn status_error_stats(status: u16) -> StreamError {
    match status {
        STATUS_NOT_MY_VBUCKET => StreamError::NotMyVbucket,
        other => status_error(other),
    }
}
