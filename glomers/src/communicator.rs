//! Defines the [`Communicator`] trait, through which nodes reach their peers.
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RpcError;
use crate::message::Payload;
use crate::NodeId;

/// How long [`Communicator::await_node_id`] sleeps between checks.
const NODE_ID_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// The messaging substrate.
///
/// Sends are unreliable. A message may be delayed, reordered with respect to
/// messages to other peers, or lost altogether. Nothing is retried on the
/// caller's behalf; see [`crate::retry`] for that.
#[async_trait]
pub trait Communicator: Clone + Send + Sync + 'static {
    /// This node's id, once it has been assigned.
    ///
    /// Ids are assigned asynchronously after the process starts, so callers
    /// must not assume it is available immediately.
    fn node_id(&self) -> Option<NodeId>;

    /// All nodes of the cluster, including this one. Empty until assigned.
    fn node_ids(&self) -> Vec<NodeId>;

    /// Sends `payload` to `dest` without waiting for (or expecting) a reply.
    fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), RpcError>;

    /// Sends `payload` to `dest` and waits up to `timeout` for its reply.
    ///
    /// An `error` reply is a reply and is returned as `Ok`.
    async fn rpc(&self, dest: &NodeId, payload: Payload, timeout: Duration)
        -> Result<Payload, RpcError>;

    /// Waits until this node's id is known.
    async fn await_node_id(&self) -> NodeId {
        loop {
            if let Some(id) = self.node_id() {
                return id;
            }

            futures_timer::Delay::new(NODE_ID_POLL_INTERVAL).await;
        }
    }
}
