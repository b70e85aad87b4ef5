//! Merge-side configuration

use std::time::Duration;

/// Default connection and per-chunk read timeout for remote indexes.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on revision-drift retries before the query fails.
pub const DEFAULT_MAX_RETRIES: u32 = 30;

/// Default pause between revision-drift retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of HTTP body chunks a remote worker keeps in flight.
pub const DEFAULT_STREAM_WINDOW: usize = 3;

/// Tunables for the merge coordinator and its workers.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Connection establishment and per-chunk read timeout for remote
    /// merge endpoints
    pub connection_timeout: Duration,

    /// Attempts before a persistently drifting design-document revision
    /// fails the query
    pub max_retries: u32,

    /// Pause between revision-drift retries
    pub retry_interval: Duration,

    /// Chunks of a remote response body held between the network and the
    /// row parser; bounds memory during partial download
    pub stream_window: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stream_window: DEFAULT_STREAM_WINDOW,
        }
    }
}
