//! Binary protocol framing
//!
//! Every message is a fixed 24-byte header followed by `body_len` bytes of
//! body (extras, then key, then value). All integers are big-endian.
//!
//! ```text
//! | 0     | magic                     |
//! | 1     | opcode                    |
//! | 2..4  | key length                |
//! | 4     | extras length             |
//! | 5     | data type                 |
//! | 6..8  | partition id / status     |
//! | 8..12 | total body length         |
//! | 12..16| opaque (request id)       |
//! | 16..24| cas                       |
//! ```
//!
//! The `field` slot at offset 6 carries the partition id on requests and
//! event messages, and the status code on responses.
//!
//! Encode/decode is synchronous over `&[u8]` / `Vec<u8>`; the receive
//! worker reads exact lengths off the socket and hands complete frames to
//! these decoders.

use crate::error::FrameError;

/// Header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Client-to-server magic byte. Event messages pushed by the server
/// (mutations, snapshot markers, stream end) also carry it.
pub const MAGIC_REQUEST: u8 = 0x80;

/// Server-to-client response magic byte.
pub const MAGIC_RESPONSE: u8 = 0x81;

// Opcodes
pub const OPCODE_STATS: u8 = 0x10;
pub const OPCODE_SASL_AUTH: u8 = 0x21;
pub const OPCODE_OPEN_CONNECTION: u8 = 0x50;
pub const OPCODE_STREAM_CLOSE: u8 = 0x52;
pub const OPCODE_STREAM_REQUEST: u8 = 0x53;
pub const OPCODE_FAILOVER_LOG_REQUEST: u8 = 0x54;
pub const OPCODE_STREAM_END: u8 = 0x55;
pub const OPCODE_SNAPSHOT_MARKER: u8 = 0x56;
pub const OPCODE_MUTATION: u8 = 0x57;
pub const OPCODE_DELETION: u8 = 0x58;
pub const OPCODE_EXPIRATION: u8 = 0x59;

// Status codes
pub const STATUS_SUCCESS: u16 = 0x00;
pub const STATUS_KEY_NOT_FOUND: u16 = 0x01;
pub const STATUS_KEY_EEXISTS: u16 = 0x02;
pub const STATUS_NOT_MY_VBUCKET: u16 = 0x07;
pub const STATUS_SASL_AUTH_FAILED: u16 = 0x20;
pub const STATUS_ERANGE: u16 = 0x22;
pub const STATUS_ROLLBACK: u16 = 0x23;

/// One `(uuid, seq)` entry of a partition's failover log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartVersion {
    pub uuid: u64,
    pub seq: u64,
}

/// Failover log, newest entry first.
pub type FailoverLog = Vec<PartVersion>;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    /// Partition id on requests/events, status on responses
    pub field: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl FrameHeader {
    pub fn status(&self) -> u16 {
        self.field
    }

    pub fn partition(&self) -> u16 {
        self.field
    }
}

/// Parse a header from the first [`HEADER_LEN`] bytes of `buf`.
pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Incomplete(HEADER_LEN));
    }
    let magic = buf[0];
    if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
        return Err(FrameError::InvalidMagic(magic));
    }
    Ok(FrameHeader {
        magic,
        opcode: buf[1],
        key_len: be_u16(&buf[2..4]),
        extras_len: buf[4],
        datatype: buf[5],
        field: be_u16(&buf[6..8]),
        body_len: be_u32(&buf[8..12]),
        opaque: be_u32(&buf[12..16]),
        cas: be_u64(&buf[16..24]),
    })
}

/// Append a header to `out`.
pub fn put_header(out: &mut Vec<u8>, header: &FrameHeader) {
    out.push(header.magic);
    out.push(header.opcode);
    out.extend_from_slice(&header.key_len.to_be_bytes());
    out.push(header.extras_len);
    out.push(header.datatype);
    out.extend_from_slice(&header.field.to_be_bytes());
    out.extend_from_slice(&header.body_len.to_be_bytes());
    out.extend_from_slice(&header.opaque.to_be_bytes());
    out.extend_from_slice(&header.cas.to_be_bytes());
}

fn request_header(opcode: u8, key_len: u16, extras_len: u8, field: u16, body_len: u32, opaque: u32) -> FrameHeader {
    FrameHeader {
        magic: MAGIC_REQUEST,
        opcode,
        key_len,
        extras_len,
        datatype: 0,
        field,
        body_len,
        opaque,
        cas: 0,
    }
}

// ============================================================================
// Request encoders
// ============================================================================

/// SASL PLAIN authentication: key is the mechanism name, value is
/// `\0user\0password`.
pub fn encode_sasl_auth(user: &str, password: &str, opaque: u32) -> Vec<u8> {
    const MECHANISM: &[u8] = b"PLAIN";
    let value_len = 1 + user.len() + 1 + password.len();
    let body_len = MECHANISM.len() + value_len;

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    put_header(
        &mut out,
        &request_header(
            OPCODE_SASL_AUTH,
            MECHANISM.len() as u16,
            0,
            0,
            body_len as u32,
            opaque,
        ),
    );
    out.extend_from_slice(MECHANISM);
    out.push(0);
    out.extend_from_slice(user.as_bytes());
    out.push(0);
    out.extend_from_slice(password.as_bytes());
    out
}

/// Open a named change-stream connection.
pub fn encode_open_connection(name: &str, flags: u32, opaque: u32) -> Vec<u8> {
    let extras_len = 8usize; // sequence number + flags
    let body_len = extras_len + name.len();

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    put_header(
        &mut out,
        &request_header(
            OPCODE_OPEN_CONNECTION,
            name.len() as u16,
            extras_len as u8,
            0,
            body_len as u32,
            opaque,
        ),
    );
    out.extend_from_slice(&0u32.to_be_bytes()); // reserved sequence number
    out.extend_from_slice(&flags.to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

/// Parameters of a stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub partition: u16,
    pub opaque: u32,
    pub flags: u32,
    pub start_seq: u64,
    pub end_seq: u64,
    /// Partition version the consumer believes in
    pub version: PartVersion,
    /// Snapshot range the consumer last saw (start and end equal to
    /// `start_seq` for a fresh stream)
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

impl StreamRequest {
    pub fn new(
        partition: u16,
        opaque: u32,
        version: PartVersion,
        start_seq: u64,
        end_seq: u64,
    ) -> Self {
        StreamRequest {
            partition,
            opaque,
            flags: 0,
            start_seq,
            end_seq,
            version,
            snapshot_start: start_seq,
            snapshot_end: start_seq,
        }
    }
}

/// Ask the server to stream one partition's changes.
pub fn encode_stream_request(req: &StreamRequest) -> Vec<u8> {
    let extras_len = 48usize;

    let mut out = Vec::with_capacity(HEADER_LEN + extras_len);
    put_header(
        &mut out,
        &request_header(
            OPCODE_STREAM_REQUEST,
            0,
            extras_len as u8,
            req.partition,
            extras_len as u32,
            req.opaque,
        ),
    );
    out.extend_from_slice(&req.flags.to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // reserved
    out.extend_from_slice(&req.start_seq.to_be_bytes());
    out.extend_from_slice(&req.end_seq.to_be_bytes());
    out.extend_from_slice(&req.version.uuid.to_be_bytes());
    out.extend_from_slice(&req.snapshot_start.to_be_bytes());
    out.extend_from_slice(&req.snapshot_end.to_be_bytes());
    out
}

/// Close one partition's stream.
pub fn encode_stream_close(partition: u16, opaque: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    put_header(
        &mut out,
        &request_header(OPCODE_STREAM_CLOSE, 0, 0, partition, 0, opaque),
    );
    out
}

/// Stat key asking for one partition's sequence numbers.
pub fn seq_stat_key(partition: u16) -> String {
    format!("vbucket-seqno {partition}")
}

/// Ask for one partition's sequence-number stats.
pub fn encode_seq_stat_request(partition: u16, opaque: u32) -> Vec<u8> {
    let key = seq_stat_key(partition);
    let mut out = Vec::with_capacity(HEADER_LEN + key.len());
    put_header(
        &mut out,
        &request_header(
            OPCODE_STATS,
            key.len() as u16,
            0,
            partition,
            key.len() as u32,
            opaque,
        ),
    );
    out.extend_from_slice(key.as_bytes());
    out
}

/// Ask for one partition's failover log.
pub fn encode_failover_log_request(partition: u16, opaque: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    put_header(
        &mut out,
        &request_header(OPCODE_FAILOVER_LOG_REQUEST, 0, 0, partition, 0, opaque),
    );
    out
}

// ============================================================================
// Inbound decoding
// ============================================================================

/// A document mutation carried by a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocMutation {
    pub seq: u64,
    pub rev_seq: u64,
    pub flags: u32,
    pub expiration: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub cas: u64,
}

/// A document removal (deletion or expiration) carried by a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocDeletion {
    pub seq: u64,
    pub rev_seq: u64,
    pub key: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// Outcome of a stream request, straight off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequestOutcome {
    /// Stream accepted; the server's failover log for the partition
    FailoverLog(FailoverLog),
    /// The requested start sequence is ahead of server history; resume
    /// from this sequence instead
    Rollback(u64),
    /// Refused with this status code
    Failed(u16),
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingFrame {
    StreamRequest {
        opaque: u32,
        outcome: StreamRequestOutcome,
    },
    FailoverLog {
        opaque: u32,
        status: u16,
        log: FailoverLog,
    },
    StreamClose {
        opaque: u32,
        status: u16,
    },
    /// One stat pair; an empty key and value terminates the group
    Stat {
        opaque: u32,
        status: u16,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    SnapshotMarker {
        opaque: u32,
        partition: u16,
        start: u64,
        end: u64,
        kind: u32,
    },
    Mutation {
        opaque: u32,
        partition: u16,
        mutation: DocMutation,
    },
    /// Deletions and expirations share this shape; both are removals
    Deletion {
        opaque: u32,
        partition: u16,
        deletion: DocDeletion,
    },
    StreamEnd {
        opaque: u32,
        partition: u16,
        flags: u32,
    },
}

/// Decode a complete inbound frame (header already parsed, `body` of the
/// declared length).
pub fn decode_frame(header: &FrameHeader, body: &[u8]) -> Result<IncomingFrame, FrameError> {
    match header.opcode {
        OPCODE_STREAM_REQUEST => decode_stream_request_response(header, body),
        OPCODE_FAILOVER_LOG_REQUEST => {
            let log = if header.status() == STATUS_SUCCESS {
                decode_failover_log(header.opcode, body)?
            } else {
                Vec::new()
            };
            Ok(IncomingFrame::FailoverLog {
                opaque: header.opaque,
                status: header.status(),
                log,
            })
        }
        OPCODE_STREAM_CLOSE => Ok(IncomingFrame::StreamClose {
            opaque: header.opaque,
            status: header.status(),
        }),
        OPCODE_STATS => {
            let key_len = header.key_len as usize;
            if body.len() < key_len {
                return Err(truncated(header, body));
            }
            Ok(IncomingFrame::Stat {
                opaque: header.opaque,
                status: header.status(),
                key: body[..key_len].to_vec(),
                value: body[key_len..].to_vec(),
            })
        }
        OPCODE_SNAPSHOT_MARKER => {
            if body.len() < 20 {
                return Err(truncated(header, body));
            }
            Ok(IncomingFrame::SnapshotMarker {
                opaque: header.opaque,
                partition: header.partition(),
                start: be_u64(&body[0..8]),
                end: be_u64(&body[8..16]),
                kind: be_u32(&body[16..20]),
            })
        }
        OPCODE_MUTATION => decode_mutation(header, body),
        OPCODE_DELETION | OPCODE_EXPIRATION => decode_deletion(header, body),
        OPCODE_STREAM_END => {
            if body.len() < 4 {
                return Err(truncated(header, body));
            }
            Ok(IncomingFrame::StreamEnd {
                opaque: header.opaque,
                partition: header.partition(),
                flags: be_u32(&body[0..4]),
            })
        }
        other => Err(FrameError::UnknownOpcode(other)),
    }
}

fn decode_stream_request_response(
    header: &FrameHeader,
    body: &[u8],
) -> Result<IncomingFrame, FrameError> {
    let outcome = match header.status() {
        STATUS_SUCCESS => StreamRequestOutcome::FailoverLog(decode_failover_log(
            header.opcode,
            body,
        )?),
        STATUS_ROLLBACK => {
            if body.len() < 8 {
                return Err(truncated(header, body));
            }
            StreamRequestOutcome::Rollback(be_u64(&body[0..8]))
        }
        status => StreamRequestOutcome::Failed(status),
    };
    Ok(IncomingFrame::StreamRequest {
        opaque: header.opaque,
        outcome,
    })
}

fn decode_failover_log(opcode: u8, body: &[u8]) -> Result<FailoverLog, FrameError> {
    if body.len() % 16 != 0 {
        return Err(FrameError::TruncatedBody {
            opcode,
            len: body.len(),
        });
    }
    Ok(body
        .chunks_exact(16)
        .map(|entry| PartVersion {
            uuid: be_u64(&entry[0..8]),
            seq: be_u64(&entry[8..16]),
        })
        .collect())
}

fn decode_mutation(header: &FrameHeader, body: &[u8]) -> Result<IncomingFrame, FrameError> {
    let extras = header.extras_len as usize;
    let key_len = header.key_len as usize;
    if extras < 31 || body.len() < extras + key_len {
        return Err(truncated(header, body));
    }
    let meta_len = be_u16(&body[28..30]) as usize;
    let rest = &body[extras + key_len..];
    if rest.len() < meta_len {
        return Err(truncated(header, body));
    }
    Ok(IncomingFrame::Mutation {
        opaque: header.opaque,
        partition: header.partition(),
        mutation: DocMutation {
            seq: be_u64(&body[0..8]),
            rev_seq: be_u64(&body[8..16]),
            flags: be_u32(&body[16..20]),
            expiration: be_u32(&body[20..24]),
            key: body[extras..extras + key_len].to_vec(),
            value: rest[..rest.len() - meta_len].to_vec(),
            cas: header.cas,
        },
    })
}

fn decode_deletion(header: &FrameHeader, body: &[u8]) -> Result<IncomingFrame, FrameError> {
    let extras = header.extras_len as usize;
    let key_len = header.key_len as usize;
    if extras < 18 || body.len() < extras + key_len {
        return Err(truncated(header, body));
    }
    Ok(IncomingFrame::Deletion {
        opaque: header.opaque,
        partition: header.partition(),
        deletion: DocDeletion {
            seq: be_u64(&body[0..8]),
            rev_seq: be_u64(&body[8..16]),
            key: body[extras..extras + key_len].to_vec(),
            metadata: body[extras + key_len..].to_vec(),
        },
    })
}

// ============================================================================
// Request decoding (the server side of the conversation)
// ============================================================================

/// A decoded client request, as a server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFrame {
    SaslAuth {
        opaque: u32,
        user: String,
        password: String,
    },
    OpenConnection {
        opaque: u32,
        flags: u32,
        name: String,
    },
    StreamRequest(StreamRequest),
    StreamClose {
        opaque: u32,
        partition: u16,
    },
    StatRequest {
        opaque: u32,
        partition: u16,
        key: String,
    },
    FailoverLogRequest {
        opaque: u32,
        partition: u16,
    },
}

/// Decode a complete client request frame.
pub fn decode_request(header: &FrameHeader, body: &[u8]) -> Result<RequestFrame, FrameError> {
    let extras = header.extras_len as usize;
    let key_len = header.key_len as usize;
    if body.len() < extras + key_len {
        return Err(truncated(header, body));
    }
    let key = &body[extras..extras + key_len];
    let value = &body[extras + key_len..];

    match header.opcode {
        OPCODE_SASL_AUTH => {
            let mut parts = value.splitn(3, |b| *b == 0);
            let _authzid = parts.next();
            let user = parts.next().ok_or_else(|| truncated(header, body))?;
            let password = parts.next().ok_or_else(|| truncated(header, body))?;
            Ok(RequestFrame::SaslAuth {
                opaque: header.opaque,
                user: utf8(user)?,
                password: utf8(password)?,
            })
        }
        OPCODE_OPEN_CONNECTION => {
            if extras < 8 {
                return Err(truncated(header, body));
            }
            Ok(RequestFrame::OpenConnection {
                opaque: header.opaque,
                flags: be_u32(&body[4..8]),
                name: utf8(key)?,
            })
        }
        OPCODE_STREAM_REQUEST => {
            if extras < 48 {
                return Err(truncated(header, body));
            }
            let start_seq = be_u64(&body[8..16]);
            Ok(RequestFrame::StreamRequest(StreamRequest {
                partition: header.partition(),
                opaque: header.opaque,
                flags: be_u32(&body[0..4]),
                start_seq,
                end_seq: be_u64(&body[16..24]),
                version: PartVersion {
                    uuid: be_u64(&body[24..32]),
                    seq: start_seq,
                },
                snapshot_start: be_u64(&body[32..40]),
                snapshot_end: be_u64(&body[40..48]),
            }))
        }
        OPCODE_STREAM_CLOSE => Ok(RequestFrame::StreamClose {
            opaque: header.opaque,
            partition: header.partition(),
        }),
        OPCODE_STATS => Ok(RequestFrame::StatRequest {
            opaque: header.opaque,
            partition: header.partition(),
            key: utf8(key)?,
        }),
        OPCODE_FAILOVER_LOG_REQUEST => Ok(RequestFrame::FailoverLogRequest {
            opaque: header.opaque,
            partition: header.partition(),
        }),
        other => Err(FrameError::UnknownOpcode(other)),
    }
}

fn truncated(header: &FrameHeader, body: &[u8]) -> FrameError {
    FrameError::TruncatedBody {
        opcode: header.opcode,
        len: body.len(),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, FrameError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| FrameError::InvalidUtf8)
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
