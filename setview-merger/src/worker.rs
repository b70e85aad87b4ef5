//! Folder workers
//!
//! One worker per backing index. A local worker drives the module's fold
//! against its set-view; a remote worker POSTs to another node's merge
//! endpoint and feeds the chunked response through the row streamer. Both
//! publish into the merge queue through a [`Producer`] whose drop guard
//! signals `done`, so every exit path (including unwinding) releases the
//! consumer barrier.
//!
//! ## Connection hygiene
//!
//! Remote responses ride pooled connections. A connection is only
//! reusable once its body has been read to the end, so the chunk reader
//! always empties the socket before letting the response go, even when
//! the parser stopped early because the queue shut down or the query was
//! cancelled.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use setview_core::{Error, LocalSpec, QueueItem, Result, SslOpts};

use crate::module::{EventMapper, LocalFold};
use crate::queue::Producer;
use crate::streamer::{RowStreamer, StreamItem};

/// Error source label for local set-views.
pub const LOCAL_SOURCE: &str = "local";

/// Everything a remote worker needs, resolved ahead of spawning.
#[derive(Debug, Clone)]
pub(crate) struct RemoteJob {
    /// Full request URL, query string included
    pub url: String,
    /// Serialized EJSON body
    pub body: String,
    /// Label attributed to this index in error items (the base URL)
    pub source: String,
    pub ssl: Option<SslOpts>,
    /// Connection establishment and per-chunk read timeout
    pub timeout: Duration,
    /// Chunks held between the socket and the parser
    pub window: usize,
}

/// Run the module fold for one local spec.
pub(crate) async fn run_local(
    fold: std::sync::Arc<dyn LocalFold>,
    spec: LocalSpec,
    producer: Producer,
    cancel: CancellationToken,
) {
    let result = tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = fold.fold(&spec, &producer) => result,
    };
    match result {
        Ok(()) => {}
        Err(Error::QueueShutdown) => {}
        Err(e) => {
            tracing::warn!(set = %spec.set_name, view = %spec.view_name, error = %e,
                "local index fold failed");
            let _ = producer
                .push(QueueItem::Error {
                    source: LOCAL_SOURCE.to_string(),
                    reason: e.to_string(),
                })
                .await;
        }
    }
    // Producer drop signals done.
}

/// Query one remote merge endpoint and stream its rows into the queue.
pub(crate) async fn run_remote(
    http: reqwest::Client,
    job: RemoteJob,
    map: EventMapper,
    producer: Producer,
    cancel: CancellationToken,
) {
    let client = match client_for(&http, &job) {
        Ok(client) => client,
        Err(e) => {
            report(&producer, &job.source, e.to_string()).await;
            return;
        }
    };

    let request = client
        .post(&job.url)
        .header("Content-Type", "application/json")
        .body(job.body.clone());

    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        sent = request.send() => match sent {
            Ok(response) => response,
            Err(e) => {
                report(&producer, &job.source, e.to_string()).await;
                return;
            }
        },
    };

    if response.status().is_success() {
        stream_rows(response, &job, map, &producer, &cancel).await;
    } else {
        let status = response.status();
        // Reading the whole body both yields the error object and empties
        // the socket.
        let body = response.bytes().await.unwrap_or_default();
        tracing::debug!(url = %job.url, %status, "remote merge endpoint returned an error");
        let _ = producer.push(map_error_body(&body, &job.source)).await;
    }
}

/// Dedicated client when the spec carries TLS overrides, pooled client
/// otherwise.
fn client_for(shared: &reqwest::Client, job: &RemoteJob) -> Result<reqwest::Client> {
    let Some(ssl) = &job.ssl else {
        return Ok(shared.clone());
    };
    let mut builder = reqwest::Client::builder()
        .connect_timeout(job.timeout)
        .danger_accept_invalid_certs(ssl.accept_invalid_certs);
    if let Some(pem) = &ssl.root_cert_pem {
        let cert = reqwest::Certificate::from_pem(pem)
            .map_err(|e| Error::http(format!("invalid root certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    builder
        .build()
        .map_err(|e| Error::http(format!("failed to build TLS client: {e}")))
}

enum BodyEnd {
    /// The socket delivered the whole body
    Finished,
    /// The consumer stopped first (cancel or queue shutdown)
    Interrupted,
}

async fn stream_rows(
    response: reqwest::Response,
    job: &RemoteJob,
    map: EventMapper,
    producer: &Producer,
    cancel: &CancellationToken,
) {
    let (tx, rx) = mpsc::channel::<std::result::Result<bytes::Bytes, String>>(job.window.max(1));
    let timeout = job.timeout;
    let reader = tokio::spawn(async move {
        let mut body = response.bytes_stream();
        loop {
            match tokio::time::timeout(timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(e.to_string())).await;
                    return;
                }
                // Body complete; the connection goes back to the pool.
                Ok(None) => return,
                Err(_) => {
                    let _ = tx.send(Err("timed out reading response body".to_string())).await;
                    break;
                }
            }
        }
        // Empty the socket on behalf of a consumer that stopped early.
        loop {
            match tokio::time::timeout(timeout, body.next()).await {
                Ok(Some(Ok(_))) => {}
                _ => return,
            }
        }
    });

    let mut streamer = RowStreamer::new();
    let outcome = consume_body(rx, &mut streamer, &map, job, producer, cancel).await;

    match outcome {
        Ok(BodyEnd::Finished) if !streamer.is_done() => {
            report(producer, &job.source, "truncated merge response".to_string()).await;
        }
        Ok(_) => {}
        Err(Error::QueueShutdown) => {}
        Err(e) => report(producer, &job.source, e.to_string()).await,
    }

    // The reader owns the response; wait for it to finish emptying the
    // socket before this worker counts as terminated.
    let _ = reader.await;
}

async fn consume_body(
    mut rx: mpsc::Receiver<std::result::Result<bytes::Bytes, String>>,
    streamer: &mut RowStreamer,
    map: &EventMapper,
    job: &RemoteJob,
    producer: &Producer,
    cancel: &CancellationToken,
) -> Result<BodyEnd> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(BodyEnd::Interrupted),
            message = rx.recv() => message,
        };
        let chunk = match message {
            None => return Ok(BodyEnd::Finished),
            Some(Ok(chunk)) => chunk,
            Some(Err(reason)) => return Err(Error::Http(reason)),
        };
        for item in streamer.feed(&chunk)? {
            if let Some(queue_item) = map(item, &job.source) {
                producer.push(queue_item).await?;
            }
        }
    }
}

async fn report(producer: &Producer, source: &str, reason: String) {
    tracing::warn!(source, %reason, "remote index worker failed");
    let _ = producer
        .push(QueueItem::Error {
            source: source.to_string(),
            reason,
        })
        .await;
}

/// Translate a non-200 response body into the queue item the caller
/// should see.
pub(crate) fn map_error_body(body: &[u8], source: &str) -> QueueItem {
    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return QueueItem::Error {
                source: source.to_string(),
                reason: String::from_utf8_lossy(body).into_owned(),
            }
        }
    };

    let error = parsed.get("error").and_then(|e| e.as_str());
    let reason = parsed.get("reason");
    let reason_str = reason.map(|r| match r {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    match (error, reason_str) {
        (Some("not_found"), Some(reason)) => {
            let reason = if reason == "missing" || reason == "deleted" {
                "not_found".to_string()
            } else {
                reason
            };
            QueueItem::Error {
                source: source.to_string(),
                reason,
            }
        }
        (Some("not_found"), None) => QueueItem::Error {
            source: source.to_string(),
            reason: "not_found".to_string(),
        },
        (Some("error"), Some(reason)) if reason == "revision_mismatch" => {
            QueueItem::RevisionMismatch
        }
        (Some("error"), Some(reason)) if reason == "set_view_outdated" => {
            QueueItem::SetViewOutdated
        }
        // Any other error shape with a usable reason string passes it
        // through; reason-less bodies are reported whole.
        (_, Some(reason)) => QueueItem::Error {
            source: source.to_string(),
            reason,
        },
        (_, None) => QueueItem::Error {
            source: source.to_string(),
            reason: parsed.to_string(),
        },
    }
}
