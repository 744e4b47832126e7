#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use glomers::error::KvError;
use glomers::kv::Consistency;
use glomers::kv::Kv;
use glomers::prototyping::DirectCommunicator;
use glomers::prototyping::DirectCommunicators;
use glomers::prototyping::MemoryKv;
use glomers::NodeId;

pub fn node_ids(count: usize) -> Vec<NodeId> {
    (0..count).map(|i| NodeId::new(format!("n{i}"))).collect()
}

pub struct KvCluster {
    pub communicators: DirectCommunicators,
    pub nodes: Vec<DirectCommunicator>,
    pub linearizable: Arc<MemoryKv>,
    pub sequential: Arc<MemoryKv>,
}

/// A cluster of `count` nodes with both key-value services registered.
pub fn kv_cluster(count: usize) -> KvCluster {
    let communicators = DirectCommunicators::new();

    let linearizable = Arc::new(MemoryKv::new());
    let sequential = Arc::new(MemoryKv::new());

    communicators.register(Consistency::Linearizable.service(), Arc::clone(&linearizable));
    communicators.register(Consistency::Sequential.service(), Arc::clone(&sequential));

    let nodes = node_ids(count)
        .into_iter()
        .map(|id| communicators.create_communicator_for(id))
        .collect();

    KvCluster {
        communicators,
        nodes,
        linearizable,
        sequential,
    }
}

/// Re-evaluates `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();

    loop {
        if check().await {
            return true;
        }

        if start.elapsed() > timeout {
            return false;
        }

        futures_timer::Delay::new(Duration::from_millis(10)).await;
    }
}

/// A key-value service whose every other compare-and-swap takes effect but
/// reports a timeout, as if the reply had been lost.
#[derive(Debug, Default)]
pub struct LostReplies<K> {
    inner: K,
    swaps: AtomicUsize,
}

impl<K> LostReplies<K> {
    pub fn new(inner: K) -> Self {
        Self {
            inner,
            swaps: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<K: Kv> Kv for LostReplies<K> {
    async fn read(&self, key: &str) -> Result<i64, KvError> {
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, value: i64) -> Result<(), KvError> {
        self.inner.write(key, value).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> Result<(), KvError> {
        self.inner
            .compare_and_swap(key, from, to, create_if_missing)
            .await?;

        if self.swaps.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            Err(KvError::Timeout)
        } else {
            Ok(())
        }
    }
}
