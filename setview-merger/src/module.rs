//! Index-module and design-doc store contracts
//!
//! Each backing-index implementation (map views, spatial views, ...) plugs
//! into the merge engine through [`IndexModule`]. The engine never looks
//! inside rows; the module supplies the ordering, the local fold, and any
//! per-row rewrite, bundled into [`MergeFuns`] per query.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use setview_core::{
    collate, DesignDoc, HttpViewArgs, LocalSpec, MergeRequest, QueueItem, RemoteMergeBody, Result,
    Stale, ViewRow,
};

use crate::queue::{Producer, RowComparator};
use crate::streamer::StreamItem;

/// Per-row rewrite applied just before delivery to the callback.
pub type RowTransform = Arc<dyn Fn(ViewRow) -> ViewRow + Send + Sync>;

/// Translation from parsed remote-stream events to queue items. `source`
/// is the remote endpoint URL, used to attribute errors.
pub type EventMapper = Arc<dyn Fn(StreamItem, &str) -> Option<QueueItem> + Send + Sync>;

/// The design-doc store the revision gate reads from.
#[async_trait]
pub trait DdocSource: Send + Sync {
    /// Fetch the named design document, or `Error::NotFound` when either
    /// the set or the document does not exist.
    async fn get_ddoc(&self, set_name: &str, ddoc_id: &str) -> Result<DesignDoc>;
}

/// The fold a local worker runs against its set-view: announce the row
/// count when the index knows it, then push rows in index order.
#[async_trait]
pub trait LocalFold: Send + Sync {
    async fn fold(&self, spec: &LocalSpec, producer: &Producer) -> Result<()>;
}

/// Everything the engine needs from a module for one query.
pub struct MergeFuns {
    /// Row ordering; `None` for index types that define none
    pub less: Option<RowComparator>,
    /// Local set-view fold
    pub fold: Arc<dyn LocalFold>,
    /// Optional per-row rewrite before delivery
    pub transform: Option<RowTransform>,
    /// Remote-stream event translation; defaults to
    /// [`default_stream_event_map`]
    pub event_map: Option<EventMapper>,
    /// Module-specific payload handed back to `process_extra_params`
    pub extra: Option<Value>,
}

/// One backing-index implementation, selected per query.
#[async_trait]
pub trait IndexModule<A: Send + 'static>: Send + Sync {
    /// Turn raw HTTP query pairs into typed view arguments.
    fn parse_http_params(
        &self,
        query: &[(String, String)],
        ddoc: &DesignDoc,
        index_name: &str,
    ) -> Result<HttpViewArgs>;

    /// Query string appended to a remote endpoint's URL.
    fn view_qs(&self, args: &HttpViewArgs) -> String {
        default_view_qs(args)
    }

    /// Inject module-specific fields into an outgoing remote body.
    fn process_extra_params(&self, _extra: Option<&Value>, _body: &mut RemoteMergeBody) {}

    /// Build the per-query function bundle.
    fn make_funs(
        &self,
        ddoc: &DesignDoc,
        index_name: &str,
        req: &MergeRequest<A>,
    ) -> Result<MergeFuns>;

    /// Skip/limit derived from the parsed arguments.
    fn get_skip_and_limit(&self, args: &HttpViewArgs) -> (u64, u64) {
        (args.skip, args.limit.unwrap_or(u64::MAX))
    }

    /// Answer a single-local-spec query without the queue/worker machinery.
    async fn simple_set_view_query(&self, req: MergeRequest<A>, ddoc: &DesignDoc) -> Result<A>;
}

/// Default `(key, id)` ordering for merged map-view rows.
pub fn default_row_comparator() -> RowComparator {
    Arc::new(|a: &ViewRow, b: &ViewRow| {
        collate::key_id_cmp(&a.key, a.id.as_deref(), &b.key, b.id.as_deref())
    })
}

/// Descending variant of [`default_row_comparator`].
pub fn descending_row_comparator() -> RowComparator {
    let ascending = default_row_comparator();
    Arc::new(move |a: &ViewRow, b: &ViewRow| ascending(b, a))
}

/// Standard mapping from remote-stream events to queue items.
///
/// A nested merge reports its own local failures as `from = "local"`;
/// those are re-attributed to the endpoint URL so the caller sees where
/// the failure actually lives.
pub fn default_stream_event_map(event: StreamItem, source: &str) -> Option<QueueItem> {
    match event {
        StreamItem::TotalRows(n) => Some(QueueItem::RowCount(n)),
        StreamItem::Row(value) => match serde_json::from_value::<ViewRow>(value) {
            Ok(row) => Some(QueueItem::Row(row)),
            Err(e) => Some(QueueItem::Error {
                source: source.to_string(),
                reason: format!("invalid row: {e}"),
            }),
        },
        StreamItem::RowError { from, reason } => {
            let source = match from {
                Some(from) if from != "local" => from,
                _ => source.to_string(),
            };
            Some(QueueItem::Error { source, reason })
        }
        StreamItem::DebugInfo { from, value } => Some(QueueItem::DebugInfo {
            source: from,
            value,
        }),
        StreamItem::End => None,
    }
}

/// Render the well-known view arguments as an URL query string.
pub fn default_view_qs(args: &HttpViewArgs) -> String {
    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    if args.descending {
        qs.append_pair("descending", "true");
    }
    if let Some(key) = &args.start_key {
        qs.append_pair("startkey", &key.to_string());
    }
    if let Some(key) = &args.end_key {
        qs.append_pair("endkey", &key.to_string());
    }
    if !args.inclusive_end {
        qs.append_pair("inclusive_end", "false");
    }
    if args.stale != Stale::False {
        qs.append_pair("stale", args.stale.as_param());
    }
    if args.include_docs {
        qs.append_pair("include_docs", "true");
    }
    if args.debug {
        qs.append_pair("debug", "true");
    }
    if args.on_error == setview_core::OnError::Stop {
        qs.append_pair("on_error", "stop");
    }
    for (name, value) in &args.extra {
        qs.append_pair(name, value);
    }
    qs.finish()
}
