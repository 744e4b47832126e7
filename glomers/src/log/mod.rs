//! Replicated append-only logs, one per topic.
//!
//! Each topic hands out offsets starting at 1. No two appends to the same
//! topic are ever given the same offset, and offsets are allocated in the
//! order in which the allocations succeed, which need not be the order in
//! which the requests arrived. Besides its entries, each topic tracks a
//! commit index: the highest offset a consumer has acknowledged. It never
//! decreases.
//!
//! Two implementations are provided. [`KvLog`] delegates durability and
//! ordering to the cluster's key-value services and is shared by all nodes.
//! [`LocalLog`] keeps each topic in memory on the node that received it.
use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::RequestError;
use crate::handler::not_supported;
use crate::handler::Handler;
use crate::message::LogEntry;
use crate::message::Offsets;
use crate::message::Payload;
use crate::NodeId;

pub mod kv;
pub mod local;

pub use kv::KvLog;
pub use local::LocalLog;

/// Entries returned by [`Log::poll`], per topic.
pub type Polled = BTreeMap<String, Vec<LogEntry>>;

#[async_trait]
pub trait Log: Send + Sync + 'static {
    type Error: Into<RequestError> + Send;

    /// Appends `msg` to `topic` and returns its offset.
    async fn send(&self, topic: &str, msg: i64) -> Result<u64, Self::Error>;

    /// Returns, for each requested topic, entries with offsets at or after the
    /// requested one, in offset order and without gaps.
    async fn poll(&self, offsets: &Offsets) -> Result<Polled, Self::Error>;

    /// Raises each topic's commit index to the given offset. Lower offsets
    /// than the current commit index are ignored.
    async fn commit_offsets(&self, offsets: &Offsets) -> Result<(), Self::Error>;

    /// Returns the commit index of those `topics` that have one.
    async fn list_committed_offsets(&self, topics: &[String]) -> Result<Offsets, Self::Error>;
}

/// Answers `send`, `poll`, `commit_offsets` and `list_committed_offsets`
/// requests from a [`Log`].
#[derive(Debug)]
pub struct LogHandler<L> {
    log: L,
}

impl<L: Log> LogHandler<L> {
    pub fn new(log: L) -> Self {
        Self { log }
    }

    pub fn log(&self) -> &L {
        &self.log
    }
}

#[async_trait]
impl<L: Log> Handler for LogHandler<L> {
    async fn handle(&self, _src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        let reply = match request {
            Payload::Send { key, msg } => self
                .log
                .send(&key, msg)
                .await
                .map(|offset| Payload::SendOk { offset }),
            Payload::Poll { offsets } => self
                .log
                .poll(&offsets)
                .await
                .map(|msgs| Payload::PollOk { msgs }),
            Payload::CommitOffsets { offsets } => self
                .log
                .commit_offsets(&offsets)
                .await
                .map(|()| Payload::CommitOffsetsOk),
            Payload::ListCommittedOffsets { keys } => self
                .log
                .list_committed_offsets(&keys)
                .await
                .map(|offsets| Payload::ListCommittedOffsetsOk { offsets }),
            other => return Err(not_supported(&other)),
        };

        reply.map_err(Into::into)
    }
}
