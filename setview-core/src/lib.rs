//! Core types shared by the set-view index merger and its collaborators.
//!
//! This crate holds the data model only: view rows and the queue-item
//! variants that flow through a merge, design documents and the revision
//! gate, the merge request with its typed EJSON body, and the crate-wide
//! error type. The machinery that moves these values around lives in
//! `setview-merger` (scatter/gather over local and remote indexes) and
//! `setview-stream` (the partition change-stream client).

pub mod collate;
pub mod config;
pub mod ddoc;
pub mod error;
pub mod request;
pub mod row;

pub use collate::json_cmp;
pub use config::MergeConfig;
pub use ddoc::{DdocRevision, DesignDoc};
pub use error::{Error, Result};
pub use request::{
    Flow, HttpViewArgs, IndexSpec, LocalSpec, MergeEvent, MergeRequest, OnError, RemoteMergeBody,
    RemoteSpec, RowCallback, SslOpts, Stale,
};
pub use row::{QueueItem, ViewRow};
