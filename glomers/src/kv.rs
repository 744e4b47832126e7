//! Defines the [`Kv`] trait and [`KvClient`], which speaks to the cluster's
//! key-value services.
//!
//! The services offer a single atomic primitive, compare-and-swap on one key.
//! Each service instance advertises one consistency level, see
//! [`Consistency`].
use std::time::Duration;

use async_trait::async_trait;

use crate::communicator::Communicator;
use crate::error::ErrorCode;
use crate::error::KvError;
use crate::message::Payload;
use crate::NodeId;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Consistency level of a key-value service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Consistency {
    /// Operations take effect in some total order consistent with each
    /// client's program order. Reads may be stale.
    Sequential,
    /// Operations take effect atomically at some point between invocation
    /// and completion.
    Linearizable,
}

impl Consistency {
    /// Node id of the service offering this level of consistency.
    pub fn service(self) -> NodeId {
        match self {
            Consistency::Sequential => NodeId::from("seq-kv"),
            Consistency::Linearizable => NodeId::from("lin-kv"),
        }
    }
}

/// A key-value store of integers.
#[async_trait]
pub trait Kv: Send + Sync + 'static {
    /// Reads `key`, failing with [`KvError::NotFound`] if it was never written.
    async fn read(&self, key: &str) -> Result<i64, KvError>;

    /// Overwrites `key` with `value`.
    async fn write(&self, key: &str, value: i64) -> Result<(), KvError>;

    /// Sets `key` to `to` iff it currently holds `from`.
    ///
    /// Fails with [`KvError::PreconditionFailed`] if it holds something else.
    /// If `key` does not exist, it is created when `create_if_missing` is set
    /// and [`KvError::NotFound`] is returned otherwise.
    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> Result<(), KvError>;
}

#[async_trait]
impl<K: Kv + ?Sized> Kv for std::sync::Arc<K> {
    async fn read(&self, key: &str) -> Result<i64, KvError> {
        (**self).read(key).await
    }

    async fn write(&self, key: &str, value: i64) -> Result<(), KvError> {
        (**self).write(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> Result<(), KvError> {
        (**self)
            .compare_and_swap(key, from, to, create_if_missing)
            .await
    }
}

/// Reaches a key-value service through a [`Communicator`].
#[derive(Clone, Debug)]
pub struct KvClient<C> {
    communicator: C,
    service: NodeId,
    timeout: Duration,
}

impl<C: Communicator> KvClient<C> {
    pub fn new(communicator: C, consistency: Consistency) -> Self {
        Self {
            communicator,
            service: consistency.service(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn sequential(communicator: C) -> Self {
        Self::new(communicator, Consistency::Sequential)
    }

    pub fn linearizable(communicator: C) -> Self {
        Self::new(communicator, Consistency::Linearizable)
    }

    /// Bounds how long each operation waits for the service's reply.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    async fn request(&self, request: Payload) -> Result<Payload, KvError> {
        let reply = self
            .communicator
            .rpc(&self.service, request, self.timeout)
            .await?;

        match reply {
            Payload::Error { code, text } => Err(match code {
                ErrorCode::KeyDoesNotExist => KvError::NotFound,
                ErrorCode::PreconditionFailed => KvError::PreconditionFailed,
                ErrorCode::Timeout => KvError::Timeout,
                code => KvError::Rejected { code, text },
            }),
            reply => Ok(reply),
        }
    }
}

#[async_trait]
impl<C: Communicator> Kv for KvClient<C> {
    async fn read(&self, key: &str) -> Result<i64, KvError> {
        let request = Payload::Read {
            key: Some(key.to_owned()),
        };

        match self.request(request).await? {
            Payload::ReadOk {
                value: Some(value), ..
            } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, key: &str, value: i64) -> Result<(), KvError> {
        let request = Payload::Write {
            key: key.to_owned(),
            value,
        };

        match self.request(request).await? {
            Payload::WriteOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> Result<(), KvError> {
        let request = Payload::Cas {
            key: key.to_owned(),
            from,
            to,
            create_if_not_exists: create_if_missing,
        };

        match self.request(request).await? {
            Payload::CasOk => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Payload) -> KvError {
    tracing::warn!("Key-value service replied with unexpected `{}`.", reply.kind());

    KvError::Unexpected(reply.kind().to_owned())
}
