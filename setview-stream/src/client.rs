//! Streaming protocol client
//!
//! A request/reply facade over one multiplexed change-stream connection.
//! All client state (outstanding requests, per-stream event queues, the
//! partition-to-request-id mapping, the request-id counter) is owned by a
//! single actor task and mutated only by its handlers; callers and the
//! receive worker talk to it through channels, so no state is ever shared
//! mutably across tasks.
//!
//! Per stream, the actor keeps a queue of undelivered events and a FIFO of
//! parked callers; at most one of the two is ever non-empty. A
//! `stream_end` event removes the stream on delivery, after which
//! `get_stream_event` reports the stream as gone.

use std::collections::{HashMap, VecDeque};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::StreamConfig;
use crate::error::{status_error, Result, StreamError};
use crate::frame::{
    decode_header, encode_failover_log_request, encode_open_connection, encode_sasl_auth,
    encode_seq_stat_request, encode_stream_close, encode_stream_request, DocDeletion,
    DocMutation, FailoverLog, PartVersion, StreamRequest, StreamRequestOutcome, HEADER_LEN,
    OPCODE_OPEN_CONNECTION, OPCODE_SASL_AUTH, STATUS_SUCCESS,
};
use crate::reader::{receive_loop, Inbound, ResponseFrame, StreamEvent};

/// Reply to a successful stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddStreamOutcome {
    /// Stream opened; the server's failover log
    FailoverLog(FailoverLog),
    /// Start sequence ahead of server history; resume from here
    Rollback(u64),
}

/// One document change folded by [`StreamClient::enum_docs_since`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocChange {
    Mutation(DocMutation),
    /// Deletion or expiration
    Deletion(DocDeletion),
}

/// Result of [`StreamClient::enum_docs_since`].
#[derive(Debug, PartialEq, Eq)]
pub enum EnumOutcome<A> {
    Done { acc: A, failover_log: FailoverLog },
    /// No offered partition version matched server history; resume from
    /// this sequence (zero: rebuild from scratch)
    Rollback(u64),
}

enum Command {
    AddStream {
        partition: u16,
        version: PartVersion,
        start_seq: u64,
        end_seq: u64,
        reply: oneshot::Sender<Result<(u32, AddStreamOutcome)>>,
    },
    RemoveStream {
        partition: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    GetStreamEvent {
        opaque: u32,
        reply: oneshot::Sender<Result<StreamEvent>>,
    },
    ListStreams {
        reply: oneshot::Sender<Result<Vec<u16>>>,
    },
    SeqStats {
        partition: u16,
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    GetFailoverLog {
        partition: u16,
        reply: oneshot::Sender<Result<FailoverLog>>,
    },
}

/// Handle on one bucket-authenticated change-stream connection.
///
/// Cheap to clone; the connection lives until every handle is dropped or
/// the receive worker dies.
#[derive(Clone)]
pub struct StreamClient {
    cmd: mpsc::Sender<Command>,
    config: StreamConfig,
}

impl StreamClient {
    /// Open a connection, authenticate against `bucket`, and perform the
    /// open-connection handshake under `name`.
    pub async fn connect(
        name: &str,
        bucket: &str,
        password: &str,
        config: StreamConfig,
    ) -> Result<StreamClient> {
        let mut socket = tokio::time::timeout(config.timeout, TcpStream::connect(config.addr()))
            .await
            .map_err(|_| StreamError::Timeout)??;

        bootstrap(&mut socket, name, bucket, password, &config).await?;
        tracing::debug!(name, bucket, addr = %config.addr(), "change-stream connection open");

        let (read, write) = socket.into_split();
        let (net_tx, net_rx) = mpsc::channel(64);
        tokio::spawn(receive_loop(read, net_tx));

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = ClientActor {
            write,
            cmd_rx,
            net_rx,
            pending: HashMap::new(),
            queues: HashMap::new(),
            active_by_part: HashMap::new(),
            next_opaque: 0,
        };
        tokio::spawn(actor.run());

        Ok(StreamClient {
            cmd: cmd_tx,
            config,
        })
    }

    /// Open a stream for one partition. On success the stream's request id
    /// keys all further event consumption.
    pub async fn add_stream(
        &self,
        partition: u16,
        version: PartVersion,
        start_seq: u64,
        end_seq: u64,
    ) -> Result<(u32, AddStreamOutcome)> {
        self.request(|reply| Command::AddStream {
            partition,
            version,
            start_seq,
            end_seq,
            reply,
        })
        .await
    }

    /// Close the active stream for one partition.
    pub async fn remove_stream(&self, partition: u16) -> Result<()> {
        self.request(|reply| Command::RemoveStream { partition, reply })
            .await
    }

    /// Next event of a stream; parks until one arrives or the stream ends.
    /// After `stream_end` the stream is gone and this reports
    /// `VbucketStreamNotFound`.
    pub async fn get_stream_event(&self, opaque: u32) -> Result<StreamEvent> {
        self.request(|reply| Command::GetStreamEvent { opaque, reply })
            .await
    }

    /// Partitions with an active stream.
    pub async fn list_streams(&self) -> Result<Vec<u16>> {
        self.request(|reply| Command::ListStreams { reply }).await
    }

    /// The partition's current high sequence number, from a stats request.
    pub async fn get_sequence_number(&self, partition: u16) -> Result<u64> {
        let pairs = self
            .request(|reply| Command::SeqStats { partition, reply })
            .await?;
        let value = pairs
            .iter()
            .find(|(key, _)| key.ends_with(":high_seqno"))
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| {
                StreamError::MalformedResponse("stats response missing high_seqno".to_string())
            })?;
        value.parse::<u64>().map_err(|_| {
            StreamError::MalformedResponse("unparseable high_seqno stat".to_string())
        })
    }

    /// The partition's failover log, or `NoFailoverLogFound` when the
    /// server reports none.
    pub async fn get_failover_log(&self, partition: u16) -> Result<FailoverLog> {
        let log = self
            .request(|reply| Command::GetFailoverLog { partition, reply })
            .await?;
        if log.is_empty() {
            return Err(StreamError::NoFailoverLogFound);
        }
        Ok(log)
    }

    /// Fold every mutation and removal of `partition` between `start_seq`
    /// (exclusive) and `end_seq` (inclusive).
    ///
    /// Partition versions are offered in order; a version the server does
    /// not recognize falls through to the next. Snapshot markers are
    /// skipped. When no version matches, the caller must rebuild from
    /// scratch: `Rollback(0)`.
    pub async fn enum_docs_since<A, F>(
        &self,
        partition: u16,
        versions: &[PartVersion],
        start_seq: u64,
        end_seq: u64,
        mut acc: A,
        mut fold: F,
    ) -> Result<EnumOutcome<A>>
    where
        F: FnMut(DocChange, A) -> A,
    {
        for version in versions {
            match self
                .add_stream(partition, *version, start_seq, end_seq)
                .await
            {
                Ok((opaque, AddStreamOutcome::FailoverLog(log))) => {
                    if log.len() > self.config.max_failover_log_size {
                        // The stream is already open on both sides; close
                        // it, or the partition stays wedged for the rest
                        // of the connection's life.
                        if let Err(e) = self.remove_stream(partition).await {
                            tracing::warn!(
                                partition,
                                error = %e,
                                "failed to close stream with oversized failover log"
                            );
                        }
                        return Err(StreamError::TooLargeFailoverLog(log.len()));
                    }
                    loop {
                        match self.get_stream_event(opaque).await? {
                            StreamEvent::SnapshotMarker { .. } => {}
                            StreamEvent::Mutation(mutation) => {
                                acc = fold(DocChange::Mutation(mutation), acc);
                            }
                            StreamEvent::Deletion(deletion) => {
                                acc = fold(DocChange::Deletion(deletion), acc);
                            }
                            StreamEvent::StreamEnd => {
                                return Ok(EnumOutcome::Done {
                                    acc,
                                    failover_log: log,
                                });
                            }
                        }
                    }
                }
                Ok((_, AddStreamOutcome::Rollback(seq))) => {
                    return Ok(EnumOutcome::Rollback(seq));
                }
                Err(StreamError::WrongPartitionVersion) => {
                    tracing::debug!(partition, uuid = version.uuid, "partition version rejected");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(EnumOutcome::Rollback(0))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd
            .send(build(tx))
            .await
            .map_err(|_| StreamError::Closed("client terminated".to_string()))?;
        rx.await
            .map_err(|_| StreamError::Closed("client terminated".to_string()))?
    }
}

/// Synchronous SASL + open-connection handshake on the raw socket, before
/// the receive worker exists.
async fn bootstrap(
    socket: &mut TcpStream,
    name: &str,
    bucket: &str,
    password: &str,
    config: &StreamConfig,
) -> Result<()> {
    socket
        .write_all(&encode_sasl_auth(bucket, password, 0))
        .await?;
    let (opcode, status) = read_bootstrap_frame(socket, config).await?;
    if opcode != OPCODE_SASL_AUTH || status != STATUS_SUCCESS {
        return Err(StreamError::SaslAuthFailed);
    }

    socket
        .write_all(&encode_open_connection(name, config.flags, 1))
        .await?;
    let (opcode, status) = read_bootstrap_frame(socket, config).await?;
    if opcode != OPCODE_OPEN_CONNECTION || status != STATUS_SUCCESS {
        return Err(status_error(status));
    }
    Ok(())
}

/// Read one frame during bootstrap, returning its opcode and status. The
/// body is read and discarded (auth errors carry a message we do not
/// surface).
async fn read_bootstrap_frame(
    socket: &mut TcpStream,
    config: &StreamConfig,
) -> Result<(u8, u16)> {
    use tokio::io::AsyncReadExt;

    let mut header_buf = [0u8; HEADER_LEN];
    tokio::time::timeout(config.timeout, socket.read_exact(&mut header_buf))
        .await
        .map_err(|_| StreamError::Timeout)??;
    let header = decode_header(&header_buf)?;

    // The body is read to keep the stream aligned; handshake errors carry
    // a message this client does not surface.
    let mut body = vec![0u8; header.body_len as usize];
    tokio::time::timeout(config.timeout, socket.read_exact(&mut body))
        .await
        .map_err(|_| StreamError::Timeout)??;
    Ok((header.opcode, header.status()))
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Default)]
struct StreamQueue {
    events: VecDeque<StreamEvent>,
    waiters: VecDeque<oneshot::Sender<Result<StreamEvent>>>,
}

enum Pending {
    AddStream {
        partition: u16,
        reply: oneshot::Sender<Result<(u32, AddStreamOutcome)>>,
    },
    RemoveStream {
        partition: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<Result<Vec<(String, String)>>>,
    },
    FailoverLog {
        reply: oneshot::Sender<Result<FailoverLog>>,
    },
}

struct ClientActor {
    write: OwnedWriteHalf,
    cmd_rx: mpsc::Receiver<Command>,
    net_rx: mpsc::Receiver<Inbound>,
    pending: HashMap<u32, Pending>,
    queues: HashMap<u32, StreamQueue>,
    active_by_part: HashMap<u16, u32>,
    next_opaque: u32,
}

impl ClientActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Err(reason) = self.handle_command(cmd).await {
                            self.fail_all(&reason);
                            return;
                        }
                    }
                    // Every handle dropped: closing the socket stops the
                    // receive worker too.
                    None => return,
                },
                msg = self.net_rx.recv() => match msg {
                    Some(Inbound::Response { opaque, response }) => {
                        self.handle_response(opaque, response);
                    }
                    Some(Inbound::Event { opaque, event }) => {
                        self.handle_event(opaque, event);
                    }
                    Some(Inbound::Closed { reason }) => {
                        tracing::warn!(%reason, "receive worker stopped; closing client");
                        self.fail_all(&reason);
                        return;
                    }
                    None => {
                        self.fail_all("receive worker stopped");
                        return;
                    }
                },
            }
        }
    }

    fn alloc_opaque(&mut self) -> u32 {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        debug_assert!(
            !self.pending.contains_key(&opaque) && !self.queues.contains_key(&opaque),
            "request id collided with an outstanding request"
        );
        opaque
    }

    async fn handle_command(&mut self, cmd: Command) -> std::result::Result<(), String> {
        match cmd {
            Command::AddStream {
                partition,
                version,
                start_seq,
                end_seq,
                reply,
            } => {
                let opaque = self.alloc_opaque();
                let frame = encode_stream_request(&StreamRequest::new(
                    partition, opaque, version, start_seq, end_seq,
                ));
                self.write.write_all(&frame).await.map_err(stringify)?;
                self.pending
                    .insert(opaque, Pending::AddStream { partition, reply });
            }

            Command::RemoveStream { partition, reply } => {
                if !self.active_by_part.contains_key(&partition) {
                    let _ = reply.send(Err(StreamError::VbucketStreamNotFound));
                    return Ok(());
                }
                let close_opaque = self.alloc_opaque();
                let frame = encode_stream_close(partition, close_opaque);
                self.write.write_all(&frame).await.map_err(stringify)?;
                self.pending
                    .insert(close_opaque, Pending::RemoveStream { partition, reply });
            }

            Command::GetStreamEvent { opaque, reply } => match self.queues.get_mut(&opaque) {
                None => {
                    let _ = reply.send(Err(StreamError::VbucketStreamNotFound));
                }
                Some(queue) => {
                    if let Some(event) = queue.events.pop_front() {
                        let ended = matches!(event, StreamEvent::StreamEnd);
                        let _ = reply.send(Ok(event));
                        if ended {
                            self.remove_ended_stream(opaque);
                        }
                    } else {
                        queue.waiters.push_back(reply);
                    }
                }
            },

            Command::ListStreams { reply } => {
                let mut partitions: Vec<u16> = self.active_by_part.keys().copied().collect();
                partitions.sort_unstable();
                let _ = reply.send(Ok(partitions));
            }

            Command::SeqStats { partition, reply } => {
                let opaque = self.alloc_opaque();
                let frame = encode_seq_stat_request(partition, opaque);
                self.write.write_all(&frame).await.map_err(stringify)?;
                self.pending.insert(opaque, Pending::Stats { reply });
            }

            Command::GetFailoverLog { partition, reply } => {
                let opaque = self.alloc_opaque();
                let frame = encode_failover_log_request(partition, opaque);
                self.write.write_all(&frame).await.map_err(stringify)?;
                self.pending.insert(opaque, Pending::FailoverLog { reply });
            }
        }
        Ok(())
    }

    fn handle_response(&mut self, opaque: u32, response: ResponseFrame) {
        let Some(pending) = self.pending.remove(&opaque) else {
            // Covers a caller that gave up as the reply was in flight.
            tracing::debug!(opaque, "response with no pending request; discarded");
            return;
        };

        match (pending, response) {
            (
                Pending::AddStream { partition, reply },
                ResponseFrame::StreamRequest(outcome),
            ) => match outcome {
                StreamRequestOutcome::FailoverLog(log) => {
                    self.queues.insert(opaque, StreamQueue::default());
                    self.active_by_part.insert(partition, opaque);
                    let _ = reply.send(Ok((opaque, AddStreamOutcome::FailoverLog(log))));
                }
                StreamRequestOutcome::Rollback(seq) => {
                    let _ = reply.send(Ok((opaque, AddStreamOutcome::Rollback(seq))));
                }
                StreamRequestOutcome::Failed(status) => {
                    let _ = reply.send(Err(status_error(status)));
                }
            },

            (Pending::RemoveStream { partition, reply }, ResponseFrame::StreamClose(result)) => {
                match result {
                    Ok(()) => {
                        self.drop_stream(partition);
                        let _ = reply.send(Ok(()));
                    }
                    // The server no longer knows the stream: drop our side
                    // of it too, then report the mismatch.
                    Err(StreamError::VbucketStreamNotFound) => {
                        self.drop_stream(partition);
                        let _ = reply.send(Err(StreamError::VbucketStreamNotFound));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }

            (Pending::Stats { reply }, ResponseFrame::Stats(result)) => {
                let _ = reply.send(result);
            }

            (Pending::FailoverLog { reply }, ResponseFrame::FailoverLog(result)) => {
                let _ = reply.send(result);
            }

            (pending, response) => {
                tracing::error!(opaque, ?response, "response kind does not match the request");
                fail_pending(pending, "mismatched response kind");
            }
        }
    }

    fn handle_event(&mut self, opaque: u32, event: StreamEvent) {
        let Some(queue) = self.queues.get_mut(&opaque) else {
            // A stream can be removed while events are in flight.
            tracing::debug!(opaque, "event for unknown stream; discarded");
            return;
        };

        if let Some(waiter) = queue.waiters.pop_front() {
            let ended = matches!(event, StreamEvent::StreamEnd);
            let _ = waiter.send(Ok(event));
            if ended {
                self.remove_ended_stream(opaque);
            }
        } else {
            queue.events.push_back(event);
        }
    }

    /// Remove a stream whose `stream_end` has been delivered. Any callers
    /// still parked see the stream as gone.
    fn remove_ended_stream(&mut self, opaque: u32) {
        if let Some(queue) = self.queues.remove(&opaque) {
            for waiter in queue.waiters {
                let _ = waiter.send(Err(StreamError::VbucketStreamNotFound));
            }
        }
        self.active_by_part.retain(|_, active| *active != opaque);
    }

    /// Remove a stream on explicit close; parked callers receive the end
    /// of the stream.
    fn drop_stream(&mut self, partition: u16) {
        let Some(opaque) = self.active_by_part.remove(&partition) else {
            return;
        };
        if let Some(queue) = self.queues.remove(&opaque) {
            for waiter in queue.waiters {
                let _ = waiter.send(Ok(StreamEvent::StreamEnd));
            }
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            fail_pending(pending, reason);
        }
        for (_, queue) in self.queues.drain() {
            for waiter in queue.waiters {
                let _ = waiter.send(Err(StreamError::Closed(reason.to_string())));
            }
        }
        self.active_by_part.clear();
    }
}

fn fail_pending(pending: Pending, reason: &str) {
    let closed = || StreamError::Closed(reason.to_string());
    match pending {
        Pending::AddStream { reply, .. } => {
            let _ = reply.send(Err(closed()));
        }
        Pending::RemoveStream { reply, .. } => {
            let _ = reply.send(Err(closed()));
        }
        Pending::Stats { reply } => {
            let _ = reply.send(Err(closed()));
        }
        Pending::FailoverLog { reply } => {
            let _ = reply.send(Err(closed()));
        }
    }
}

fn stringify(e: std::io::Error) -> String {
    e.to_string()
}
