//! View rows and the items that flow through a merge queue

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record produced by a backing index.
///
/// Rows are opaque to the merge queue; ordering comes from the comparator
/// the index module supplies (see [`crate::collate::json_cmp`] for the
/// default map-view ordering).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// Emitted key
    pub key: Value,

    /// Document id, when the index tracks one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Emitted value
    #[serde(default)]
    pub value: Value,

    /// Partition the row came from (present in debug mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<u16>,

    /// Full document body, when `include_docs` was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl ViewRow {
    /// Row with a key and value only
    pub fn new(key: Value, value: Value) -> Self {
        ViewRow {
            key,
            id: None,
            value,
            partition: None,
            doc: None,
        }
    }

    /// Row with a key, document id, and value
    pub fn keyed(key: Value, id: impl Into<String>, value: Value) -> Self {
        ViewRow {
            key,
            id: Some(id.into()),
            value,
            partition: None,
            doc: None,
        }
    }
}

/// One item published into the merge queue by a folder worker.
///
/// Sentinels (everything except `Row`) sort ahead of data rows so the
/// consumer observes failures and count announcements before any row that
/// was enqueued alongside them.
#[derive(Debug, Clone)]
pub enum QueueItem {
    /// A data row
    Row(ViewRow),

    /// Per-producer total row count, announced at most once before the
    /// producer's first row
    RowCount(u64),

    /// A per-producer failure; `source` names the backing index
    Error { source: String, reason: String },

    /// Diagnostic passthrough from a backing index
    DebugInfo { source: String, value: Value },

    /// The resolved design document revision no longer matches; the whole
    /// query must restart
    RevisionMismatch,

    /// A backing set-view can no longer serve the requested partitions
    SetViewOutdated,
}

impl QueueItem {
    /// Sentinel precedence class; lower sorts first. Data rows are last and
    /// compare among themselves with the caller's comparator.
    pub fn sort_class(&self) -> u8 {
        match self {
            QueueItem::RevisionMismatch => 0,
            QueueItem::SetViewOutdated => 1,
            QueueItem::Error { .. } => 2,
            QueueItem::RowCount(_) => 3,
            QueueItem::DebugInfo { .. } => 4,
            QueueItem::Row(_) => 5,
        }
    }

    /// True for anything that is not a data row
    pub fn is_sentinel(&self) -> bool {
        !matches!(self, QueueItem::Row(_))
    }
}
