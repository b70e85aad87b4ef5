//! Client for the binary partition change-stream protocol
//!
//! One TCP connection multiplexes request/response pairs and long-lived
//! per-partition event streams, matched up by opaque request ids. The
//! crate splits into three layers:
//!
//! - [`frame`]: bit-exact encode/decode of the 24-byte-header wire format
//! - [`reader`]: the single task that parses everything inbound
//! - [`client`]: the stateful facade (`add_stream`, `get_stream_event`,
//!   `enum_docs_since`, ...) backed by an actor that owns all bookkeeping
//!
//! ```text
//! caller ──> StreamClient ──commands──> actor ──writes──> socket
//!                ^                        ^                  │
//!                └── replies/events ──────┴── receive worker ┘
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod frame;
pub mod reader;

pub use client::{AddStreamOutcome, DocChange, EnumOutcome, StreamClient};
pub use config::StreamConfig;
pub use error::{FrameError, Result, StreamError};
pub use frame::{DocDeletion, DocMutation, FailoverLog, PartVersion};
pub use reader::StreamEvent;
