//! Glomers provides node behaviors for a cluster that talks over an
//! unreliable message-passing substrate. Messages may be delayed, reordered,
//! dropped or cut off by partitions. On top of that substrate the crate builds
//! three guarantees that no single link offers:
//!
//! - eventual delivery of broadcast values to every node,
//! - a replicated append-only log with stable offsets, and
//! - a replicated counter that never loses an increment.
//!
//! # Usage
//!
//! Every engine is a [`Handler`]. It is constructed with a
//! [`Communicator`][communicator::Communicator], i.e. the substrate through
//! which it reaches its peers, and handed to a runtime that feeds it inbound
//! requests and delivers its replies. The [`stdio`] module provides the
//! runtime used in deployment; the `prototyping` feature provides an
//! in-process simulation of a lossy network that is used for testing.
//!
//! ```no_run
//! use glomers::counter::Counter;
//! use glomers::kv::KvClient;
//! use glomers::stdio::Stdio;
//!
//! let pool = futures::executor::ThreadPool::new().unwrap();
//! let stdio = Stdio::new();
//! let counter = Counter::new(KvClient::sequential(stdio.clone()));
//!
//! glomers::stdio::serve(&stdio, counter, pool).unwrap();
//! ```
//!
//! # Protocols
//!
//! ## Broadcast
//!
//! Values are disseminated either by flooding them along the announced
//! topology or by funnelling them through a root node that periodically
//! pushes batches down a spanning tree. Both rely on [`retry::Outbox`], which
//! re-sends each message until it is acknowledged, and on deduplication at
//! the receiver, which makes the resulting duplicate deliveries harmless.
//!
//! ## Log
//!
//! Offsets are claimed one at a time in a linearizable key-value service,
//! each with a compare-and-swap that is safe to repeat, and the highest claim
//! is recorded with [`cas::optimistic_update`]. Payloads are stored under
//! `<topic>_<offset>` in a sequentially consistent service.
//! A node-local variant keeps every topic in memory behind its own lock.
//!
//! ## Counter
//!
//! The counter is the smallest instance of the same CAS loop: read the
//! current value, add the delta, swap, repeat on contention. A swap that goes
//! unanswered is not repeated, see [`cas::OnTimeout`].

//
// Lint configuration
#![warn(rust_2018_idioms)]
#![warn(clippy::wildcard_imports)]

pub mod broadcast;
pub mod cas;
pub mod communicator;
pub mod counter;
pub mod error;
pub mod executor;
pub mod handler;
pub mod ids;
pub mod kv;
pub mod log;
pub mod message;
#[cfg(feature = "prototyping")]
pub mod prototyping;
pub mod retry;
pub mod stdio;
mod util;

use std::borrow::Borrow;
use std::fmt;

pub use error::ErrorCode;
pub use error::RequestError;
#[doc(inline)]
pub use handler::Handler;
pub use message::Body;
pub use message::Message;
pub use message::Payload;

/// Identifier of a node or client participating in the cluster, e.g. `n3`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NodeId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
