//! A grow-and-shrink counter shared by all nodes through a key-value service.
//!
//! Every `add` is applied with an optimistic update, so concurrent adds from
//! different nodes are never lost. A swap that times out is not repeated: it
//! may have taken effect already, and repeating it would apply the delta
//! twice. Such an `add` fails with a timeout, leaving its outcome indefinite.
use async_trait::async_trait;
use tracing::debug;

use crate::cas::read_or_zero;
use crate::cas::update_with;
use crate::cas::OnTimeout;
use crate::cas::Updated;
use crate::error::KvError;
use crate::error::RequestError;
use crate::handler::not_supported;
use crate::handler::Handler;
use crate::kv::Kv;
use crate::message::Payload;
use crate::NodeId;

/// Key under which the counter's value is stored.
pub const KEY: &str = "count";

#[derive(Debug)]
pub struct Counter<K> {
    kv: K,
}

impl<K: Kv> Counter<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// Adds `delta`, which may be negative.
    ///
    /// Fails with [`KvError::Timeout`] if the final swap went unanswered, in
    /// which case `delta` may or may not have been added.
    pub async fn add(&self, delta: i64) -> Result<(), KvError> {
        if delta == 0 {
            return Ok(());
        }

        let updated = update_with(&self.kv, KEY, OnTimeout::Fail, |current| {
            Some(current.unwrap_or(0).wrapping_add(delta))
        })
        .await?;

        match updated {
            Updated::Swapped { from, to } => debug!("Counter moved from {:?} to {}.", from, to),
            // a concurrent initializer raced ahead, the add counts as complete
            Updated::Raced => debug!("Counter was created concurrently."),
            Updated::Kept(_) => {}
        }

        Ok(())
    }

    /// Current value, zero if nothing was ever added.
    pub async fn read(&self) -> Result<i64, KvError> {
        read_or_zero(&self.kv, KEY).await
    }
}

#[async_trait]
impl<K: Kv> Handler for Counter<K> {
    async fn handle(&self, _src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        match request {
            Payload::Add { delta } => {
                self.add(delta).await?;
                Ok(Payload::AddOk)
            }
            Payload::Read { .. } => Ok(Payload::ReadOk {
                messages: None,
                value: Some(self.read().await?),
            }),
            other => Err(not_supported(&other)),
        }
    }
}
