//! Receive worker
//!
//! The single task that owns the read half of the socket. It reads exact
//! header and body lengths (blocking, no timeout: streams are long-lived
//! and silence is normal), decodes each frame, and forwards it to the
//! client actor as either a response or a stream event.
//!
//! Stats responses arrive as one frame per key/value pair, terminated by
//! an empty frame; the worker accumulates the group and emits a single
//! response. Any socket error or unknown opcode terminates the worker,
//! and with it the client.

use std::collections::HashMap;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;

use crate::error::{status_error, status_error_stats, StreamError};
use crate::frame::{
    decode_frame, decode_header, DocDeletion, DocMutation, FailoverLog, IncomingFrame,
    StreamRequestOutcome, HEADER_LEN, STATUS_SUCCESS,
};

/// An event observed on an active partition stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Brackets a consistent group of changes
    SnapshotMarker { start: u64, end: u64 },
    Mutation(DocMutation),
    /// Deletion or expiration; both remove the document
    Deletion(DocDeletion),
    /// Always the final event of a stream
    StreamEnd,
}

/// A reply to one outstanding request.
#[derive(Debug)]
pub enum ResponseFrame {
    StreamRequest(StreamRequestOutcome),
    FailoverLog(Result<FailoverLog, StreamError>),
    StreamClose(Result<(), StreamError>),
    Stats(Result<Vec<(String, String)>, StreamError>),
}

/// What the receive worker forwards to the client actor.
#[derive(Debug)]
pub enum Inbound {
    Response { opaque: u32, response: ResponseFrame },
    Event { opaque: u32, event: StreamEvent },
    /// The socket is gone or the server spoke out of turn
    Closed { reason: String },
}

/// Run until the socket fails, the server sends something indecipherable,
/// or the actor goes away.
pub(crate) async fn receive_loop(mut read: OwnedReadHalf, tx: mpsc::Sender<Inbound>) {
    // Stat groups under accumulation, keyed by request id.
    let mut stat_groups: HashMap<u32, Vec<(String, String)>> = HashMap::new();
    let mut header_buf = [0u8; HEADER_LEN];

    loop {
        if let Err(e) = read.read_exact(&mut header_buf).await {
            let _ = tx
                .send(Inbound::Closed {
                    reason: e.to_string(),
                })
                .await;
            return;
        }

        let header = match decode_header(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                let _ = tx
                    .send(Inbound::Closed {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let mut body = vec![0u8; header.body_len as usize];
        if let Err(e) = read.read_exact(&mut body).await {
            let _ = tx
                .send(Inbound::Closed {
                    reason: e.to_string(),
                })
                .await;
            return;
        }

        let frame = match decode_frame(&header, &body) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, opcode = header.opcode, "undecodable frame");
                let _ = tx
                    .send(Inbound::Closed {
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let message = match frame {
            IncomingFrame::StreamRequest { opaque, outcome } => Some(Inbound::Response {
                opaque,
                response: ResponseFrame::StreamRequest(outcome),
            }),

            IncomingFrame::FailoverLog {
                opaque,
                status,
                log,
            } => {
                let result = if status == STATUS_SUCCESS {
                    Ok(log)
                } else {
                    Err(status_error(status))
                };
                Some(Inbound::Response {
                    opaque,
                    response: ResponseFrame::FailoverLog(result),
                })
            }

            IncomingFrame::StreamClose { opaque, status } => {
                let result = if status == STATUS_SUCCESS {
                    Ok(())
                } else {
                    Err(status_error(status))
                };
                Some(Inbound::Response {
                    opaque,
                    response: ResponseFrame::StreamClose(result),
                })
            }

            IncomingFrame::Stat {
                opaque,
                status,
                key,
                value,
            } => {
                if status != STATUS_SUCCESS {
                    stat_groups.remove(&opaque);
                    Some(Inbound::Response {
                        opaque,
                        response: ResponseFrame::Stats(Err(status_error_stats(status))),
                    })
                } else if key.is_empty() && value.is_empty() {
                    // Terminator: the group is complete.
                    let pairs = stat_groups.remove(&opaque).unwrap_or_default();
                    Some(Inbound::Response {
                        opaque,
                        response: ResponseFrame::Stats(Ok(pairs)),
                    })
                } else {
                    let entry = (
                        String::from_utf8_lossy(&key).into_owned(),
                        String::from_utf8_lossy(&value).into_owned(),
                    );
                    stat_groups.entry(opaque).or_default().push(entry);
                    None
                }
            }

            IncomingFrame::SnapshotMarker {
                opaque, start, end, ..
            } => Some(Inbound::Event {
                opaque,
                event: StreamEvent::SnapshotMarker { start, end },
            }),

            IncomingFrame::Mutation {
                opaque, mutation, ..
            } => Some(Inbound::Event {
                opaque,
                event: StreamEvent::Mutation(mutation),
            }),

            IncomingFrame::Deletion {
                opaque, deletion, ..
            } => Some(Inbound::Event {
                opaque,
                event: StreamEvent::Deletion(deletion),
            }),

            IncomingFrame::StreamEnd { opaque, .. } => Some(Inbound::Event {
                opaque,
                event: StreamEvent::StreamEnd,
            }),
        };

        if let Some(message) = message {
            if tx.send(message).await.is_err() {
                // Actor gone; the client is shutting down.
                return;
            }
        }
    }
}
