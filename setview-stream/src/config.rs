//! Stream client configuration

use std::time::Duration;

/// Default TCP port of the change-stream server.
pub const DEFAULT_PORT: u16 = 11210;

/// Default socket connect/handshake timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on accepted failover-log length.
pub const DEFAULT_MAX_FAILOVER_LOG_SIZE: usize = 25;

/// Connection settings for one [`crate::StreamClient`].
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,

    /// Applied to connect and to each bootstrap handshake read
    pub timeout: Duration,

    /// Failover logs longer than this fail `enum_docs_since`
    pub max_failover_log_size: usize,

    /// Open-connection flags passed through to the server
    pub flags: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            max_failover_log_size: DEFAULT_MAX_FAILOVER_LOG_SIZE,
            flags: 0,
        }
    }
}

impl StreamConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
