//! Defines the [`Handler`] trait.
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RequestError;
use crate::message::Payload;
use crate::NodeId;

/// Answers the requests delivered to a node.
///
/// Requests are handled concurrently, one task per inbound message, so
/// implementations must guard their shared state themselves.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Invoked once the node has learned its own id and the cluster's members.
    async fn init(&self, _node_id: &NodeId, _node_ids: &[NodeId]) {}

    /// Produces the reply to `request`, which was sent by `src`.
    ///
    /// Errors are answered with an `error` reply carrying
    /// [`RequestError::code`].
    async fn handle(&self, src: NodeId, request: Payload) -> Result<Payload, RequestError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn init(&self, node_id: &NodeId, node_ids: &[NodeId]) {
        (**self).init(node_id, node_ids).await
    }

    async fn handle(&self, src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        (**self).handle(src, request).await
    }
}

/// Replies to requests of kinds a handler does not know.
pub(crate) fn not_supported(request: &Payload) -> RequestError {
    RequestError::NotSupported(request.kind().to_owned())
}

/// Answers `request` with a regular reply or the matching `error` reply.
pub(crate) async fn answer<H: Handler + ?Sized>(
    handler: &H,
    src: NodeId,
    request: Payload,
) -> Payload {
    let kind = request.kind();

    match handler.handle(src, request).await {
        Ok(reply) => reply,
        Err(err) => {
            tracing::debug!("Failed to handle `{}` request: {}", kind, err);

            Payload::error(err.code(), err.to_string())
        }
    }
}
