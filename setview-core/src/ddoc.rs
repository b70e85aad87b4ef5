//! Design documents and the revision gate

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A versioned server-side artifact describing a view or index.
///
/// Revisions are opaque strings compared by equality only; no revision
/// tree or ancestry semantics exist at this layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignDoc {
    pub id: String,
    pub rev: String,
    pub body: Value,
}

impl DesignDoc {
    pub fn new(id: impl Into<String>, rev: impl Into<String>, body: Value) -> Self {
        DesignDoc {
            id: id.into(),
            rev: rev.into(),
            body,
        }
    }
}

/// The design-document revision a merge request demands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DdocRevision {
    /// No revision checking at all
    #[default]
    Unchecked,

    /// Accept whatever the authoritative store currently has; on drift
    /// detected mid-query the coordinator re-resolves and retries
    Auto,

    /// This exact revision or fail with a revision mismatch
    Exact(String),
}

impl DdocRevision {
    /// Whether the revision gate participates in this query at all.
    /// When enabled, the resolved revision is also forwarded to remote
    /// merge endpoints so they can detect drift on their side.
    pub fn checking_enabled(&self) -> bool {
        !matches!(self, DdocRevision::Unchecked)
    }
}
