//! Shared fixtures for merge scenario tests: an in-memory map-view module,
//! scripted design-doc stores, and axum-backed remote merge endpoints.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use serde_json::{json, Value};

use setview_core::{
    DesignDoc, Error, Flow, HttpViewArgs, LocalSpec, MergeEvent, MergeRequest, QueueItem,
    Result, RowCallback, ViewRow,
};
use setview_merger::{
    default_row_comparator, DdocSource, IndexModule, LocalFold, MergeFuns, Producer,
};

/// Event log accumulated by the test callback.
pub type Log = Vec<String>;

/// Callback that records every event and always continues.
pub fn logging_callback() -> RowCallback<Log> {
    Box::new(|event, mut acc: Log| {
        acc.push(render_event(&event));
        Ok(Flow::Continue(acc))
    })
}

/// Callback that stops right after recording the given number of rows.
pub fn stop_after_rows_callback(max_rows: usize) -> RowCallback<Log> {
    Box::new(move |event, mut acc: Log| {
        let is_row = matches!(event, MergeEvent::Row(_));
        acc.push(render_event(&event));
        if is_row {
            let rows = acc.iter().filter(|e| e.starts_with("row:")).count();
            if rows >= max_rows {
                return Ok(Flow::Stop(acc));
            }
        }
        Ok(Flow::Continue(acc))
    })
}

pub fn render_event(event: &MergeEvent) -> String {
    match event {
        MergeEvent::Start { total_rows } => format!("start:{total_rows}"),
        MergeEvent::Row(row) => format!("row:{}", row.key),
        MergeEvent::Error { source, reason } => format!("error:{source}:{reason}"),
        MergeEvent::DebugInfo { source, .. } => format!("debug:{source}"),
        MergeEvent::Stop => "stop".to_string(),
    }
}

pub fn rows_from_keys(keys: &[i64]) -> Vec<ViewRow> {
    keys.iter()
        .map(|key| ViewRow::new(json!(key), Value::Null))
        .collect()
}

/// JSON body a well-behaved remote merge endpoint would stream.
pub fn remote_body_json(keys: &[i64]) -> String {
    let rows: Vec<Value> = keys.iter().map(|key| json!({"key": key})).collect();
    json!({"total_rows": keys.len(), "rows": rows}).to_string()
}

// =============================================================================
// Design-doc store
// =============================================================================

/// Serves a scripted sequence of revisions, repeating the last one.
pub struct ScriptedDdocs {
    revs: Vec<String>,
    fetches: AtomicUsize,
}

impl ScriptedDdocs {
    pub fn new(revs: &[&str]) -> Arc<Self> {
        Arc::new(ScriptedDdocs {
            revs: revs.iter().map(|r| r.to_string()).collect(),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DdocSource for ScriptedDdocs {
    async fn get_ddoc(&self, _set_name: &str, ddoc_id: &str) -> Result<DesignDoc> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        let rev = self
            .revs
            .get(n.min(self.revs.len() - 1))
            .cloned()
            .ok_or_else(|| Error::not_found(ddoc_id.to_string()))?;
        Ok(DesignDoc::new(ddoc_id, rev, json!({})))
    }
}

/// A store with no documents at all.
pub struct EmptyDdocs;

#[async_trait]
impl DdocSource for EmptyDdocs {
    async fn get_ddoc(&self, set_name: &str, ddoc_id: &str) -> Result<DesignDoc> {
        Err(Error::not_found(format!("{set_name}/{ddoc_id}")))
    }
}

// =============================================================================
// In-memory map-view module
// =============================================================================

/// Map-view module over in-memory row sets keyed by set name.
pub struct MapModule {
    rows: HashMap<String, Vec<ViewRow>>,
}

impl MapModule {
    pub fn new(sets: &[(&str, &[i64])]) -> Self {
        MapModule {
            rows: sets
                .iter()
                .map(|(name, keys)| (name.to_string(), rows_from_keys(keys)))
                .collect(),
        }
    }
}

struct MapFold {
    rows: HashMap<String, Vec<ViewRow>>,
}

#[async_trait]
impl LocalFold for MapFold {
    async fn fold(&self, spec: &LocalSpec, producer: &Producer) -> Result<()> {
        let rows = self
            .rows
            .get(&spec.set_name)
            .ok_or_else(|| Error::not_found(spec.set_name.clone()))?;
        producer.push(QueueItem::RowCount(rows.len() as u64)).await?;
        for row in rows {
            producer.push(QueueItem::Row(row.clone())).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IndexModule<Log> for MapModule {
    fn parse_http_params(
        &self,
        _query: &[(String, String)],
        _ddoc: &DesignDoc,
        _index_name: &str,
    ) -> Result<HttpViewArgs> {
        Ok(HttpViewArgs::default())
    }

    fn make_funs(
        &self,
        _ddoc: &DesignDoc,
        _index_name: &str,
        _req: &MergeRequest<Log>,
    ) -> Result<MergeFuns> {
        Ok(MergeFuns {
            less: Some(default_row_comparator()),
            fold: Arc::new(MapFold {
                rows: self.rows.clone(),
            }),
            transform: None,
            event_map: None,
            extra: None,
        })
    }

    async fn simple_set_view_query(&self, req: MergeRequest<Log>, _ddoc: &DesignDoc) -> Result<Log> {
        let MergeRequest {
            specs,
            mut callback,
            acc,
            mut skip,
            mut limit,
            ..
        } = req;
        let local = specs
            .first()
            .and_then(|s| s.as_local())
            .ok_or_else(|| Error::not_found("local spec"))?;
        let rows = self
            .rows
            .get(&local.set_name)
            .ok_or_else(|| Error::not_found(local.set_name.clone()))?;

        let mut acc = match callback(
            MergeEvent::Start {
                total_rows: rows.len() as u64,
            },
            acc,
        )? {
            Flow::Continue(acc) => acc,
            Flow::Stop(acc) => return Ok(acc),
        };
        for row in rows {
            if skip > 0 {
                skip -= 1;
                continue;
            }
            if limit == 0 {
                break;
            }
            match callback(MergeEvent::Row(row.clone()), acc)? {
                Flow::Continue(next) => {
                    acc = next;
                    limit = limit.saturating_sub(1);
                }
                Flow::Stop(acc) => return Ok(acc),
            }
        }
        match callback(MergeEvent::Stop, acc)? {
            Flow::Continue(acc) | Flow::Stop(acc) => Ok(acc),
        }
    }
}

// =============================================================================
// HTTP servers
// =============================================================================

/// Serve a router on an ephemeral port, returning the merge endpoint URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}/_view_merge")
}

pub fn local_spec(set_name: &str) -> LocalSpec {
    LocalSpec {
        set_name: set_name.to_string(),
        ddoc_id: "_design/test".to_string(),
        view_name: "mapview".to_string(),
        partitions: vec![0, 1, 2, 3],
    }
}
