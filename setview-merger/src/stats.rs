//! Query timing observer
//!
//! The coordinator reports one timing per finished query; where those
//! numbers go is the host's concern.

use std::time::Duration;

/// Injected sink for per-query timings.
pub trait QueryStats: Send + Sync {
    fn record(&self, ddoc_id: &str, index_name: &str, elapsed: Duration);
}

/// Discards every timing.
pub struct NoopStats;

impl QueryStats for NoopStats {
    fn record(&self, _ddoc_id: &str, _index_name: &str, _elapsed: Duration) {}
}

/// Logs timings through `tracing` at debug level.
pub struct TracingStats;

impl QueryStats for TracingStats {
    fn record(&self, ddoc_id: &str, index_name: &str, elapsed: Duration) {
        tracing::debug!(
            ddoc_id,
            index_name,
            elapsed_ms = elapsed.as_millis() as u64,
            "merge query finished"
        );
    }
}
