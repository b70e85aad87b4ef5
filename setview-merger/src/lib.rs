//! Scatter/gather merge engine for set-view indexes
//!
//! A merge query fans out to N backing indexes, local set-views and
//! remote merge endpoints alike, and folds their row streams back into a
//! single ordered stream for the caller:
//!
//! ```text
//! coordinator ── spawns ──> folder workers ── push ──> merge queue
//!      │                                                   │
//!      └──────────── drains through the row collector <────┘
//! ```
//!
//! The [`coordinator::IndexMerger`] owns the query lifecycle: design-doc
//! resolution and the revision gate, worker spawning and teardown, retry
//! on revision drift. Index-type specifics (row ordering, the local fold,
//! HTTP parameter handling) come from an [`module::IndexModule`]
//! implementation supplied per query.

pub mod collector;
pub mod coordinator;
pub mod module;
pub mod queue;
pub mod stats;
pub mod streamer;
mod worker;

pub use collector::{RowCollector, Step};
pub use coordinator::IndexMerger;
pub use module::{
    default_row_comparator, default_stream_event_map, default_view_qs, descending_row_comparator,
    DdocSource, EventMapper, IndexModule, LocalFold, MergeFuns, RowTransform,
};
pub use queue::{MergeQueue, Popped, Producer, RowComparator};
pub use stats::{NoopStats, QueryStats, TracingStats};
pub use streamer::{RowStreamer, StreamItem};
pub use worker::LOCAL_SOURCE;
