//! A scripted change-stream server for client tests.
//!
//! Accepts one connection, answers the SASL/open handshake, and serves
//! stream requests from an in-memory document set: snapshot marker, one
//! mutation (or deletion) per sequence, then `stream_end` unless the
//! stream is configured to stay open.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use setview_stream::frame::{
    decode_header, decode_request, put_header, FrameHeader, RequestFrame, HEADER_LEN,
    MAGIC_REQUEST, MAGIC_RESPONSE, OPCODE_DELETION, OPCODE_FAILOVER_LOG_REQUEST, OPCODE_MUTATION,
    OPCODE_OPEN_CONNECTION, OPCODE_SASL_AUTH, OPCODE_SNAPSHOT_MARKER, OPCODE_STATS,
    OPCODE_STREAM_CLOSE, OPCODE_STREAM_END, OPCODE_STREAM_REQUEST, STATUS_KEY_NOT_FOUND,
    STATUS_ROLLBACK, STATUS_SASL_AUTH_FAILED, STATUS_SUCCESS,
};
use setview_stream::StreamConfig;

#[derive(Clone)]
pub struct FakeServer {
    /// Reject SASL outright
    pub sasl_fail: bool,
    /// Partition uuid the server recognizes; anything else gets
    /// KEY_NOT_FOUND (= wrong partition version)
    pub accepted_uuid: Option<u64>,
    /// Highest sequence the server holds; requests starting beyond it
    /// are told to roll back
    pub num_docs: u64,
    /// Sequence the rollback response points at
    pub rollback_to: u64,
    /// Sequences served as deletions instead of mutations
    pub delete_seqs: Vec<u64>,
    /// Failover log served with streams and failover-log requests
    pub failover_log: Vec<(u64, u64)>,
    /// Keep streams open after serving: no stream_end
    pub hold_stream: bool,
    /// Error status for stats requests (None = serve the stat)
    pub stats_status: Option<u16>,
    pub high_seqno: u64,
    /// Answer stream requests with an opcode the client cannot know
    pub garbage_response: bool,
}

impl Default for FakeServer {
    fn default() -> Self {
        FakeServer {
            sasl_fail: false,
            accepted_uuid: None,
            num_docs: 10,
            rollback_to: 0,
            delete_seqs: Vec::new(),
            failover_log: vec![(0xabcd, 0)],
            hold_stream: false,
            stats_status: None,
            high_seqno: 10,
            garbage_response: false,
        }
    }
}

impl FakeServer {
    /// Bind, spawn the accept loop, and return a client config pointing at
    /// the server.
    pub async fn spawn(self) -> StreamConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            self.serve(socket).await;
        });
        StreamConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            ..StreamConfig::default()
        }
    }

    async fn serve(&self, mut socket: tokio::net::TcpStream) {
        let mut header_buf = [0u8; HEADER_LEN];
        loop {
            if socket.read_exact(&mut header_buf).await.is_err() {
                return;
            }
            let header = decode_header(&header_buf).expect("request header");
            let mut body = vec![0u8; header.body_len as usize];
            if socket.read_exact(&mut body).await.is_err() {
                return;
            }
            let request = decode_request(&header, &body).expect("request frame");

            let mut out = Vec::new();
            match request {
                RequestFrame::SaslAuth { opaque, .. } => {
                    let status = if self.sasl_fail {
                        STATUS_SASL_AUTH_FAILED
                    } else {
                        STATUS_SUCCESS
                    };
                    response(&mut out, OPCODE_SASL_AUTH, status, opaque, &[]);
                }

                RequestFrame::OpenConnection { opaque, .. } => {
                    response(&mut out, OPCODE_OPEN_CONNECTION, STATUS_SUCCESS, opaque, &[]);
                }

                RequestFrame::StreamRequest(req) => {
                    if self.garbage_response {
                        response(&mut out, 0x7f, STATUS_SUCCESS, req.opaque, &[]);
                    } else if self
                        .accepted_uuid
                        .is_some_and(|uuid| uuid != req.version.uuid)
                    {
                        response(
                            &mut out,
                            OPCODE_STREAM_REQUEST,
                            STATUS_KEY_NOT_FOUND,
                            req.opaque,
                            &[],
                        );
                    } else if req.start_seq > self.num_docs {
                        response(
                            &mut out,
                            OPCODE_STREAM_REQUEST,
                            STATUS_ROLLBACK,
                            req.opaque,
                            &self.rollback_to.to_be_bytes(),
                        );
                    } else {
                        response(
                            &mut out,
                            OPCODE_STREAM_REQUEST,
                            STATUS_SUCCESS,
                            req.opaque,
                            &log_bytes(&self.failover_log),
                        );
                        let last = req.end_seq.min(self.num_docs);
                        snapshot_marker(&mut out, req.opaque, req.partition, req.start_seq + 1, last);
                        for seq in req.start_seq + 1..=last {
                            if self.delete_seqs.contains(&seq) {
                                deletion(&mut out, req.opaque, req.partition, seq);
                            } else {
                                mutation(&mut out, req.opaque, req.partition, seq);
                            }
                        }
                        if !self.hold_stream {
                            stream_end(&mut out, req.opaque, req.partition);
                        }
                    }
                }

                RequestFrame::StreamClose { opaque, .. } => {
                    response(&mut out, OPCODE_STREAM_CLOSE, STATUS_SUCCESS, opaque, &[]);
                }

                RequestFrame::StatRequest { opaque, partition, .. } => {
                    if let Some(status) = self.stats_status {
                        response(&mut out, OPCODE_STATS, status, opaque, &[]);
                    } else {
                        stat_pair(
                            &mut out,
                            opaque,
                            &format!("vb_{partition}:high_seqno"),
                            &self.high_seqno.to_string(),
                        );
                        stat_pair(
                            &mut out,
                            opaque,
                            &format!("vb_{partition}:abs_high_seqno"),
                            &self.high_seqno.to_string(),
                        );
                        // Zero-body terminator closes the group.
                        response(&mut out, OPCODE_STATS, STATUS_SUCCESS, opaque, &[]);
                    }
                }

                RequestFrame::FailoverLogRequest { opaque, .. } => {
                    response(
                        &mut out,
                        OPCODE_FAILOVER_LOG_REQUEST,
                        STATUS_SUCCESS,
                        opaque,
                        &log_bytes(&self.failover_log),
                    );
                }
            }

            if socket.write_all(&out).await.is_err() {
                return;
            }
        }
    }
}

fn log_bytes(log: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(log.len() * 16);
    for (uuid, seq) in log {
        out.extend_from_slice(&uuid.to_be_bytes());
        out.extend_from_slice(&seq.to_be_bytes());
    }
    out
}

fn response(out: &mut Vec<u8>, opcode: u8, status: u16, opaque: u32, body: &[u8]) {
    put_header(
        out,
        &FrameHeader {
            magic: MAGIC_RESPONSE,
            opcode,
            key_len: 0,
            extras_len: 0,
            datatype: 0,
            field: status,
            body_len: body.len() as u32,
            opaque,
            cas: 0,
        },
    );
    out.extend_from_slice(body);
}

fn snapshot_marker(out: &mut Vec<u8>, opaque: u32, partition: u16, start: u64, end: u64) {
    let mut body = Vec::with_capacity(20);
    body.extend_from_slice(&start.to_be_bytes());
    body.extend_from_slice(&end.to_be_bytes());
    body.extend_from_slice(&1u32.to_be_bytes());
    event(out, OPCODE_SNAPSHOT_MARKER, opaque, partition, 20, 0, &body, 0);
}

fn mutation(out: &mut Vec<u8>, opaque: u32, partition: u16, seq: u64) {
    let key = format!("doc{seq}");
    let value = format!(r#"{{"seq":{seq}}}"#);
    let mut body = Vec::new();
    body.extend_from_slice(&seq.to_be_bytes());
    body.extend_from_slice(&seq.to_be_bytes()); // rev seq
    body.extend_from_slice(&0u32.to_be_bytes()); // flags
    body.extend_from_slice(&0u32.to_be_bytes()); // expiration
    body.extend_from_slice(&0u32.to_be_bytes()); // lock time
    body.extend_from_slice(&0u16.to_be_bytes()); // metadata length
    body.push(0); // nru
    body.extend_from_slice(key.as_bytes());
    body.extend_from_slice(value.as_bytes());
    event(
        out,
        OPCODE_MUTATION,
        opaque,
        partition,
        31,
        key.len() as u16,
        &body,
        seq,
    );
}

fn deletion(out: &mut Vec<u8>, opaque: u32, partition: u16, seq: u64) {
    let key = format!("doc{seq}");
    let mut body = Vec::new();
    body.extend_from_slice(&seq.to_be_bytes());
    body.extend_from_slice(&seq.to_be_bytes()); // rev seq
    body.extend_from_slice(&0u16.to_be_bytes()); // metadata length
    body.extend_from_slice(key.as_bytes());
    event(
        out,
        OPCODE_DELETION,
        opaque,
        partition,
        18,
        key.len() as u16,
        &body,
        seq,
    );
}

fn stream_end(out: &mut Vec<u8>, opaque: u32, partition: u16) {
    let body = 0u32.to_be_bytes();
    event(out, OPCODE_STREAM_END, opaque, partition, 4, 0, &body, 0);
}

fn stat_pair(out: &mut Vec<u8>, opaque: u32, key: &str, value: &str) {
    let mut body = Vec::new();
    body.extend_from_slice(key.as_bytes());
    body.extend_from_slice(value.as_bytes());
    put_header(
        out,
        &FrameHeader {
            magic: MAGIC_RESPONSE,
            opcode: OPCODE_STATS,
            key_len: key.len() as u16,
            extras_len: 0,
            datatype: 0,
            field: STATUS_SUCCESS,
            body_len: body.len() as u32,
            opaque,
            cas: 0,
        },
    );
    out.extend_from_slice(&body);
}

fn event(
    out: &mut Vec<u8>,
    opcode: u8,
    opaque: u32,
    partition: u16,
    extras_len: u8,
    key_len: u16,
    body: &[u8],
    cas: u64,
) {
    put_header(
        out,
        &FrameHeader {
            magic: MAGIC_REQUEST,
            opcode,
            key_len,
            extras_len,
            datatype: 0,
            field: partition,
            body_len: body.len() as u32,
            opaque,
            cas,
        },
    );
    out.extend_from_slice(body);
}
