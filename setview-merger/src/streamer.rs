//! Incremental merge-response parser
//!
//! A remote merge endpoint answers with one JSON object, streamed in
//! chunks:
//!
//! ```text
//! {"total_rows": 6, "rows": [ {...}, {...} ], "errors": [...], "debug_info": {...}}
//! ```
//!
//! The streamer accumulates bytes and yields complete items per feed
//! without ever buffering the whole body. Only complete top-level array
//! elements and member values are materialized; everything in between
//! stays in the carry buffer. Unknown top-level keys are skipped.

use serde_json::Value;

use setview_core::{Error, Result};

/// One parsed piece of a merge response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// The endpoint's `total_rows` announcement
    TotalRows(u64),
    /// One element of the `rows` array, unvalidated
    Row(Value),
    /// One element of the `errors` array
    RowError {
        from: Option<String>,
        reason: String,
    },
    /// One entry of the `debug_info` object
    DebugInfo { from: String, value: Value },
    /// The closing brace of the response object
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    TotalRows,
    Rows,
    Errors,
    DebugInfo,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Expect the opening `{`
    Start,
    /// Inside the top object, expect a key or `}`
    BeforeKey,
    /// Got a key, expect `:`
    AfterKey(Section),
    /// Expect the member value
    MemberValue(Section),
    /// Inside a `rows`/`errors` array, expect an element or `]`
    InArray(Section),
    /// After an array element, expect `,` or `]`
    AfterElement(Section),
    /// After a member value, expect `,` or `}`
    AfterMember,
    /// The top object is closed
    Done,
}

pub struct RowStreamer {
    buf: Vec<u8>,
    state: State,
}

impl RowStreamer {
    pub fn new() -> Self {
        RowStreamer {
            buf: Vec::new(),
            state: State::Start,
        }
    }

    /// Whether the closing brace of the response has been consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed bytes, returning every item that completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<StreamItem>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut pos = 0usize;

        loop {
            skip_ws(&self.buf, &mut pos);
            if pos >= self.buf.len() {
                break;
            }
            let byte = self.buf[pos];

            match self.state {
                State::Start => {
                    expect(byte, b'{', "response must be a JSON object")?;
                    pos += 1;
                    self.state = State::BeforeKey;
                }

                State::BeforeKey => {
                    if byte == b'}' {
                        pos += 1;
                        self.state = State::Done;
                        out.push(StreamItem::End);
                        continue;
                    }
                    let Some(end) = scan_string(&self.buf, pos)? else {
                        break;
                    };
                    let section = match &self.buf[pos + 1..end - 1] {
                        b"total_rows" => Section::TotalRows,
                        b"rows" => Section::Rows,
                        b"errors" => Section::Errors,
                        b"debug_info" => Section::DebugInfo,
                        _ => Section::Other,
                    };
                    pos = end;
                    self.state = State::AfterKey(section);
                }

                State::AfterKey(section) => {
                    expect(byte, b':', "expected ':' after member key")?;
                    pos += 1;
                    self.state = State::MemberValue(section);
                }

                State::MemberValue(section) => match section {
                    Section::Rows | Section::Errors => {
                        expect(byte, b'[', "rows and errors must be arrays")?;
                        pos += 1;
                        self.state = State::InArray(section);
                    }
                    Section::TotalRows => {
                        let Some(end) = scan_value(&self.buf, pos)? else {
                            break;
                        };
                        let total: u64 = serde_json::from_slice(&self.buf[pos..end])?;
                        out.push(StreamItem::TotalRows(total));
                        pos = end;
                        self.state = State::AfterMember;
                    }
                    Section::DebugInfo => {
                        let Some(end) = scan_value(&self.buf, pos)? else {
                            break;
                        };
                        let value: Value = serde_json::from_slice(&self.buf[pos..end])?;
                        if let Value::Object(entries) = value {
                            for (from, value) in entries {
                                out.push(StreamItem::DebugInfo { from, value });
                            }
                        }
                        pos = end;
                        self.state = State::AfterMember;
                    }
                    Section::Other => {
                        let Some(end) = scan_value(&self.buf, pos)? else {
                            break;
                        };
                        pos = end;
                        self.state = State::AfterMember;
                    }
                },

                State::InArray(section) => {
                    if byte == b']' {
                        pos += 1;
                        self.state = State::AfterMember;
                        continue;
                    }
                    let Some(end) = scan_value(&self.buf, pos)? else {
                        break;
                    };
                    let value: Value = serde_json::from_slice(&self.buf[pos..end])?;
                    out.push(match section {
                        Section::Rows => StreamItem::Row(value),
                        Section::Errors => parse_error_entry(value),
                        _ => unreachable!("only rows and errors stream as arrays"),
                    });
                    pos = end;
                    self.state = State::AfterElement(section);
                }

                State::AfterElement(section) => {
                    match byte {
                        b',' => self.state = State::InArray(section),
                        b']' => self.state = State::AfterMember,
                        other => {
                            return Err(invalid(other, "expected ',' or ']' in array"));
                        }
                    }
                    pos += 1;
                }

                State::AfterMember => {
                    match byte {
                        b',' => self.state = State::BeforeKey,
                        b'}' => {
                            self.state = State::Done;
                            out.push(StreamItem::End);
                        }
                        other => {
                            return Err(invalid(other, "expected ',' or '}' in object"));
                        }
                    }
                    pos += 1;
                }

                // Trailing bytes after the object are ignored.
                State::Done => {
                    pos = self.buf.len();
                }
            }
        }

        self.buf.drain(..pos);
        Ok(out)
    }
}

impl Default for RowStreamer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_error_entry(value: Value) -> StreamItem {
    let from = value
        .get("from")
        .and_then(|f| f.as_str())
        .map(str::to_string);
    let reason = match value.get("reason") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => value.to_string(),
    };
    StreamItem::RowError { from, reason }
}

fn skip_ws(buf: &[u8], pos: &mut usize) {
    while *pos < buf.len() && matches!(buf[*pos], b' ' | b'\t' | b'\n' | b'\r') {
        *pos += 1;
    }
}

fn expect(byte: u8, want: u8, context: &str) -> Result<()> {
    if byte == want {
        Ok(())
    } else {
        Err(invalid(byte, context))
    }
}

fn invalid(byte: u8, context: &str) -> Error {
    Error::Http(format!(
        "malformed merge response: {context} (found 0x{byte:02x})"
    ))
}

/// End offset (exclusive) of one complete JSON value starting at `start`,
/// or `None` when the buffer ends mid-value.
fn scan_value(buf: &[u8], start: usize) -> Result<Option<usize>> {
    match buf[start] {
        b'"' => scan_string(buf, start),
        b'{' | b'[' => scan_nested(buf, start),
        b't' | b'n' => Ok(complete_if(buf, start + 4)),
        b'f' => Ok(complete_if(buf, start + 5)),
        b'-' | b'0'..=b'9' => {
            let mut i = start + 1;
            while i < buf.len() && matches!(buf[i], b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E')
            {
                i += 1;
            }
            // A number at the buffer's edge may still grow; wait for a
            // terminator byte.
            if i == buf.len() {
                Ok(None)
            } else {
                Ok(Some(i))
            }
        }
        other => Err(invalid(other, "expected a JSON value")),
    }
}

fn complete_if(buf: &[u8], end: usize) -> Option<usize> {
    if end <= buf.len() {
        Some(end)
    } else {
        None
    }
}

/// End offset of a complete string literal, escape-aware.
fn scan_string(buf: &[u8], start: usize) -> Result<Option<usize>> {
    expect(buf[start], b'"', "expected a string")?;
    let mut i = start + 1;
    while i < buf.len() {
        match buf[i] {
            b'\\' => i += 2,
            b'"' => return Ok(Some(i + 1)),
            _ => i += 1,
        }
    }
    Ok(None)
}

/// End offset of a complete object or array, tracking nesting and strings.
fn scan_nested(buf: &[u8], start: usize) -> Result<Option<usize>> {
    let mut depth = 0usize;
    let mut i = start;
    while i < buf.len() {
        match buf[i] {
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Ok(Some(i));
                }
            }
            b'"' => match scan_string(buf, i)? {
                Some(end) => i = end,
                None => return Ok(None),
            },
            _ => i += 1,
        }
    }
    Ok(None)
}
