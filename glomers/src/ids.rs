//! Cluster-wide unique ids without coordination.
//!
//! An id is `<unix seconds>.<node id>.<sequence number>`. The node id makes
//! ids from different nodes distinct, the sequence number makes ids from the
//! same node distinct.
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;

use crate::communicator::Communicator;
use crate::error::RequestError;
use crate::handler::not_supported;
use crate::handler::Handler;
use crate::message::Payload;
use crate::util::unix_secs;
use crate::NodeId;

#[derive(Debug)]
pub struct IdGenerator<C> {
    communicator: C,
    next: AtomicU64,
}

impl<C: Communicator> IdGenerator<C> {
    pub fn new(communicator: C) -> Self {
        Self {
            communicator,
            next: AtomicU64::new(0),
        }
    }

    /// Generates a fresh id, waiting for this node's id if necessary.
    pub async fn generate(&self) -> String {
        let node_id = self.communicator.await_node_id().await;
        let sequence = self.next.fetch_add(1, Ordering::Relaxed);

        format_id(unix_secs(), &node_id, sequence)
    }
}

#[async_trait]
impl<C: Communicator> Handler for IdGenerator<C> {
    async fn handle(&self, _src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        match request {
            Payload::Generate => Ok(Payload::GenerateOk {
                id: self.generate().await,
            }),
            other => Err(not_supported(&other)),
        }
    }
}

fn format_id(secs: u64, node_id: &NodeId, sequence: u64) -> String {
    format!("{secs}.{node_id}.{sequence}")
}
