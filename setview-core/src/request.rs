//! Merge requests, index specifications, and the caller callback contract

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ddoc::DdocRevision;
use crate::error::Result;
use crate::row::ViewRow;

/// One backing index a query fans out to.
#[derive(Debug, Clone)]
pub enum IndexSpec {
    /// A set-view served by this node
    Local(LocalSpec),
    /// A merge endpoint on another node, queried over HTTP
    Remote(RemoteSpec),
}

impl IndexSpec {
    pub fn as_local(&self) -> Option<&LocalSpec> {
        match self {
            IndexSpec::Local(spec) => Some(spec),
            IndexSpec::Remote(_) => None,
        }
    }
}

/// A local set-view: one materialized index over the named partitions.
#[derive(Debug, Clone)]
pub struct LocalSpec {
    pub set_name: String,
    pub ddoc_id: String,
    pub view_name: String,
    /// Partitions the query wants covered; empty means all active
    pub partitions: Vec<u16>,
}

/// A remote merge endpoint plus the body it should be asked with.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    /// Base URL of the remote `_view_merge` endpoint
    pub url: String,
    pub body: RemoteMergeBody,
    /// TLS overrides for this endpoint only
    pub ssl: Option<SslOpts>,
}

/// TLS options passed through to the HTTP client for one remote spec.
#[derive(Debug, Clone, Default)]
pub struct SslOpts {
    pub accept_invalid_certs: bool,
    /// PEM-encoded additional root certificate
    pub root_cert_pem: Option<Vec<u8>>,
}

/// The EJSON body POSTed to a remote merge endpoint.
///
/// Typed at the boundary: the well-known keys are fields, everything else
/// rides along untouched in `rest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMergeBody {
    /// The nested view specification the remote should merge
    pub views: Value,

    /// Resolved design-document revision; present iff revision checking is
    /// enabled for the query, so the remote can detect drift
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ddoc_revision: Option<String>,

    /// Keys this layer does not interpret
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl RemoteMergeBody {
    pub fn new(views: Value) -> Self {
        RemoteMergeBody {
            views,
            ddoc_revision: None,
            rest: serde_json::Map::new(),
        }
    }
}

/// Staleness the caller tolerates from the backing indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stale {
    /// Update the index before answering
    #[default]
    False,
    /// Answer from the index as-is
    Ok,
    /// Answer as-is, then trigger an update
    UpdateAfter,
}

impl Stale {
    pub fn as_param(&self) -> &'static str {
        match self {
            Stale::False => "false",
            Stale::Ok => "ok",
            Stale::UpdateAfter => "update_after",
        }
    }
}

/// What to do when a backing index reports an error mid-merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Deliver the error to the callback and keep merging the others
    #[default]
    Continue,
    /// Deliver the error, then end the merge
    Stop,
}

/// HTTP-level query parameters, typed for the keys this layer understands.
#[derive(Debug, Clone)]
pub struct HttpViewArgs {
    pub descending: bool,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub inclusive_end: bool,
    pub stale: Stale,
    pub include_docs: bool,
    /// Carry per-partition provenance on each row
    pub debug: bool,
    pub skip: u64,
    pub limit: Option<u64>,
    pub on_error: OnError,
    /// Parameters passed through to remote endpoints verbatim
    pub extra: Vec<(String, String)>,
}

impl Default for HttpViewArgs {
    fn default() -> Self {
        HttpViewArgs {
            descending: false,
            start_key: None,
            end_key: None,
            inclusive_end: true,
            stale: Stale::default(),
            include_docs: false,
            debug: false,
            skip: 0,
            limit: None,
            on_error: OnError::default(),
            extra: Vec::new(),
        }
    }
}

/// Event delivered to the caller's callback.
#[derive(Debug, Clone)]
pub enum MergeEvent {
    /// First event of a query: the summed row count across all indexes
    Start { total_rows: u64 },
    /// A merged data row
    Row(ViewRow),
    /// A backing index failed; the merge continues unless the callback
    /// (or the request's `on_error`) says otherwise
    Error { source: String, reason: String },
    /// Diagnostics from a backing index, delivered transparently
    DebugInfo { source: String, value: Value },
    /// Last event of a query
    Stop,
}

/// Callback verdict: keep folding, or end the query with this accumulator.
#[derive(Debug)]
pub enum Flow<A> {
    Continue(A),
    Stop(A),
}

/// The caller's fold over merge events, in `try_fold` style: the
/// accumulator is threaded through and the final value becomes the query
/// reply.
pub type RowCallback<A> = Box<dyn FnMut(MergeEvent, A) -> Result<Flow<A>> + Send>;

/// Immutable configuration for one merge query.
pub struct MergeRequest<A> {
    pub specs: Vec<IndexSpec>,
    pub revision: DdocRevision,
    pub args: HttpViewArgs,
    /// Rows to drop before the first delivery
    pub skip: u64,
    /// Rows to deliver before ending the merge; `u64::MAX` means unlimited
    pub limit: u64,
    /// Connection establishment and per-chunk read timeout for remote indexes
    pub timeout: Duration,
    /// Optional watchdog for the single-spec fast path; the query fails
    /// with a timeout if no reply is produced in time
    pub watchdog: Option<Duration>,
    pub callback: RowCallback<A>,
    /// Initial accumulator; cloned per attempt so a revision-drift retry
    /// restarts the fold from the beginning
    pub acc: A,
    /// When the caller started timing the query; defaults to entry into
    /// the coordinator
    pub started_at: Option<Instant>,
}

impl<A> MergeRequest<A> {
    pub fn new(specs: Vec<IndexSpec>, callback: RowCallback<A>, acc: A) -> Self {
        MergeRequest {
            specs,
            revision: DdocRevision::default(),
            args: HttpViewArgs::default(),
            skip: 0,
            limit: u64::MAX,
            timeout: crate::config::DEFAULT_CONNECTION_TIMEOUT,
            watchdog: None,
            callback,
            acc,
            started_at: None,
        }
    }

    /// First local spec in the request, if any. Design documents are
    /// resolved from here; remote ("merge") specs carry no ddoc of their
    /// own.
    pub fn first_local_spec(&self) -> Option<&LocalSpec> {
        self.specs.iter().find_map(|s| s.as_local())
    }
}

impl<A> std::fmt::Debug for MergeRequest<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeRequest")
            .field("specs", &self.specs.len())
            .field("revision", &self.revision)
            .field("skip", &self.skip)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_body_serializes_flat() {
        let mut body = RemoteMergeBody::new(json!({"sets": {"s1": {"view": "test/v1"}}}));
        body.ddoc_revision = Some("2-def".into());
        body.rest
            .insert("keys".into(), json!(["a", "b"]));

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(
            encoded,
            json!({
                "views": {"sets": {"s1": {"view": "test/v1"}}},
                "ddoc_revision": "2-def",
                "keys": ["a", "b"],
            })
        );
    }

    #[test]
    fn test_remote_body_rev_omitted_when_unchecked() {
        let body = RemoteMergeBody::new(json!({}));
        let encoded = serde_json::to_value(&body).unwrap();
        assert!(encoded.get("ddoc_revision").is_none());
    }

    #[test]
    fn test_first_local_spec_skips_remotes() {
        let req: MergeRequest<()> = MergeRequest::new(
            vec![
                IndexSpec::Remote(RemoteSpec {
                    url: "http://other/_view_merge".into(),
                    body: RemoteMergeBody::new(json!({})),
                    ssl: None,
                }),
                IndexSpec::Local(LocalSpec {
                    set_name: "s1".into(),
                    ddoc_id: "_design/test".into(),
                    view_name: "v1".into(),
                    partitions: vec![0, 1],
                }),
            ],
            Box::new(|_, acc| Ok(Flow::Continue(acc))),
            (),
        );

        assert_eq!(req.first_local_spec().unwrap().set_name, "s1");
    }
}
