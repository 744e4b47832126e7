//! Disseminates broadcast values to every node of the cluster.
//!
//! Two strategies are available, see [`Strategy`]. Both deliver every value
//! to every reachable node eventually, provided the network eventually lets
//! enough retried sends through. Neither makes the reply to `broadcast` wait
//! for propagation: forwarding happens in the background through an
//! [`Outbox`], and its progress is only observable through `read`.
//!
//! Peers exchange values as `gossip` batches, which the outbox merges while
//! a destination is unreachable. A value is only recorded once it has been
//! handed to the outbox. If that fails, the request is answered as
//! temporarily unavailable, which the sender's outbox retries.
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_lock::Mutex;
use async_lock::RwLock;
use async_trait::async_trait;
use tracing::debug;
use tracing::info;

use crate::communicator::Communicator;
use crate::error::RequestError;
use crate::error::SpawnError;
use crate::executor::Executor;
use crate::handler::not_supported;
use crate::handler::Handler;
use crate::message::Payload;
use crate::retry::Outbox;
use crate::NodeId;

pub mod topology;

pub use topology::Topology;

/// How values travel from the node they were injected at to all others.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Every node forwards each value it hasn't seen before to all of its
    /// neighbors in the announced topology, except the one it came from.
    FloodFill,

    /// Values are funnelled to a single root node which periodically pushes
    /// them, batched, down a spanning tree of bounded out-degree.
    Tree,
}

/// Configuration of a [`Broadcast`] node.
#[derive(Clone, Debug)]
pub struct Config {
    strategy: Strategy,
    flush_interval: Duration,
    rpc_timeout: Duration,
    fanout: usize,
    root: Option<NodeId>,
    max_in_flight: usize,
    retry_pause: Duration,
}

impl Config {
    pub fn flood_fill() -> Self {
        Self::with_strategy(Strategy::FloodFill)
    }

    pub fn tree() -> Self {
        Self::with_strategy(Strategy::Tree)
    }

    fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy,
            flush_interval: Duration::from_millis(300),
            rpc_timeout: Duration::from_secs(1),
            fanout: 2,
            root: None,
            max_in_flight: 64,
            retry_pause: Duration::from_millis(100),
        }
    }

    /// How often the root pushes buffered values down the tree.
    pub fn with_flush_interval(self, flush_interval: Duration) -> Self {
        Self {
            flush_interval,
            ..self
        }
    }

    /// How long each delivery attempt waits for an acknowledgement.
    pub fn with_rpc_timeout(self, rpc_timeout: Duration) -> Self {
        Self {
            rpc_timeout,
            ..self
        }
    }

    /// Maximal number of children per node in the spanning tree.
    pub fn with_fanout(self, fanout: usize) -> Self {
        assert!(fanout > 0);

        Self { fanout, ..self }
    }

    /// Designates the tree's root. Defaults to the first node of the cluster.
    pub fn with_root(self, root: impl Into<NodeId>) -> Self {
        Self {
            root: Some(root.into()),
            ..self
        }
    }

    /// Caps concurrently retried deliveries per destination.
    pub fn with_max_in_flight(self, max_in_flight: usize) -> Self {
        assert!(max_in_flight > 0);

        Self {
            max_in_flight,
            ..self
        }
    }

    /// Upper bound of the random pause between delivery attempts.
    pub fn with_retry_pause(self, retry_pause: Duration) -> Self {
        Self {
            retry_pause,
            ..self
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::tree()
    }
}

#[derive(Debug, Default)]
struct Layout {
    topology: Topology,
    root: Option<NodeId>,
}

#[derive(Debug, Default)]
struct Seen {
    values: BTreeSet<i64>,
    /// Values injected at the root that are yet to be pushed down the tree.
    buffer: Vec<i64>,
}

/// The broadcast node.
pub struct Broadcast<C, E> {
    communicator: C,
    outbox: Outbox<C, E>,
    config: Config,
    layout: RwLock<Layout>,
    seen: Mutex<Seen>,
}

impl<C: Communicator, E: Executor> Broadcast<C, E> {
    /// Creates the node and, for the tree strategy, starts the loop that
    /// periodically flushes the root's buffer.
    pub fn spawn(communicator: C, executor: E, config: Config) -> Result<Arc<Self>, SpawnError> {
        let outbox = Outbox::new(
            communicator.clone(),
            executor.clone(),
            config.rpc_timeout,
            config.max_in_flight,
        )
        .with_retry_pause(config.retry_pause);

        let this = Arc::new(Self {
            communicator,
            outbox,
            config,
            layout: RwLock::new(Layout::default()),
            seen: Mutex::new(Seen::default()),
        });

        if this.config.strategy == Strategy::Tree {
            executor.execute(flush_periodically(Arc::downgrade(&this)))?;
        }

        Ok(this)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accepts `value`, sent by `src`, for dissemination.
    pub async fn on_broadcast(&self, src: &NodeId, value: i64) -> Result<(), RequestError> {
        match self.config.strategy {
            Strategy::FloodFill => self.spread(src, vec![value]).await,
            Strategy::Tree => self.funnel(value).await,
        }
    }

    /// Accepts values forwarded by peer `src`.
    ///
    /// The tree's root buffers them for its next flush. Any other node merges
    /// them and passes the ones it hadn't seen on, to its children in the
    /// tree or to its neighbors except `src` when flooding.
    pub async fn on_gossip(&self, src: &NodeId, values: Vec<i64>) -> Result<(), RequestError> {
        if self.config.strategy == Strategy::Tree {
            let me = self.node_id()?;

            if self.tree_root().await? == me {
                self.buffer(values).await;
                return Ok(());
            }
        }

        self.spread(src, values).await
    }

    /// All values seen so far, in no particular order.
    pub async fn on_read(&self) -> Vec<i64> {
        self.seen.lock().await.values.iter().copied().collect()
    }

    /// Adopts the announced topology.
    ///
    /// The tree strategy keeps the spanning tree it computed at startup.
    pub async fn on_topology(&self, topology: HashMap<NodeId, Vec<NodeId>>) {
        match self.config.strategy {
            Strategy::FloodFill => {
                let topology = Topology::from_map(topology);
                debug!("Adopting topology of {} node(s).", topology.len());

                self.layout.write().await.topology = topology;
            }
            Strategy::Tree => {
                debug!("Ignoring announced topology in favor of spanning tree.");
            }
        }
    }

    /// Pushes the root's buffered values down the tree.
    ///
    /// Returns the number of values flushed. Does nothing on other nodes. If
    /// the batch can't be handed to the outbox, it stays buffered.
    pub async fn flush(&self) -> Result<usize, SpawnError> {
        let me = match self.communicator.node_id() {
            Some(me) => me,
            None => return Ok(0),
        };

        let batch = {
            let mut seen = self.seen.lock().await;
            let batch = std::mem::take(&mut seen.buffer);
            seen.values.extend(batch.iter().copied());
            batch
        };

        if batch.is_empty() {
            return Ok(0);
        }

        let children = self.neighbors_of(&me).await;
        debug!("Flushing {} value(s) to {:?}.", batch.len(), children);

        if let Err(err) = self.post_all(children, &batch).await {
            let mut seen = self.seen.lock().await;

            for value in &batch {
                seen.values.remove(value);
            }
            seen.buffer.extend(batch);
            seen.buffer.sort_unstable();
            seen.buffer.dedup();

            return Err(err);
        }

        Ok(batch.len())
    }

    /// Stops all background deliveries.
    pub fn shut_down(&self) {
        self.outbox.shut_down();
    }

    /// Records `values` and forwards the fresh ones to every neighbor but
    /// `src`.
    async fn spread(&self, src: &NodeId, values: Vec<i64>) -> Result<(), RequestError> {
        let me = self.node_id()?;

        let fresh: Vec<i64> = {
            let mut seen = self.seen.lock().await;
            values
                .into_iter()
                .filter(|v| seen.values.insert(*v))
                .collect()
        };

        if fresh.is_empty() {
            return Ok(());
        }

        let targets = self
            .neighbors_of(&me)
            .await
            .into_iter()
            .filter(|n| n != src)
            .collect();

        if let Err(err) = self.post_all(targets, &fresh).await {
            let mut seen = self.seen.lock().await;
            for value in &fresh {
                seen.values.remove(value);
            }

            return Err(RequestError::Unavailable(err.to_string()));
        }

        Ok(())
    }

    async fn funnel(&self, value: i64) -> Result<(), RequestError> {
        let me = self.node_id()?;
        let root = self.tree_root().await?;

        if root == me {
            self.buffer(vec![value]).await;
        } else {
            self.outbox
                .post(root, Payload::Gossip {
                    messages: vec![value],
                })
                .await
                .map_err(|err| RequestError::Unavailable(err.to_string()))?;
        }

        Ok(())
    }

    async fn buffer(&self, values: Vec<i64>) {
        let mut seen = self.seen.lock().await;

        for value in values {
            if !seen.values.contains(&value) && !seen.buffer.contains(&value) {
                seen.buffer.push(value);
            }
        }
    }

    async fn post_all(&self, targets: Vec<NodeId>, values: &[i64]) -> Result<(), SpawnError> {
        for target in targets {
            self.outbox
                .post(target, Payload::Gossip {
                    messages: values.to_vec(),
                })
                .await?;
        }

        Ok(())
    }

    fn node_id(&self) -> Result<NodeId, RequestError> {
        self.communicator
            .node_id()
            .ok_or_else(|| RequestError::Unavailable("node id not yet assigned".to_owned()))
    }

    async fn neighbors_of(&self, node: &NodeId) -> Vec<NodeId> {
        self.layout.read().await.topology.neighbors_of(node).to_vec()
    }

    async fn root(&self) -> Option<NodeId> {
        self.layout.read().await.root.clone()
    }

    async fn tree_root(&self) -> Result<NodeId, RequestError> {
        self.root()
            .await
            .ok_or_else(|| RequestError::Unavailable("tree not yet built".to_owned()))
    }
}

#[async_trait]
impl<C: Communicator, E: Executor> Handler for Broadcast<C, E> {
    async fn init(&self, node_id: &NodeId, node_ids: &[NodeId]) {
        if self.config.strategy != Strategy::Tree {
            return;
        }

        let root = self
            .config
            .root
            .clone()
            .or_else(|| node_ids.first().cloned())
            .unwrap_or_else(|| node_id.clone());

        let mut ordered = vec![root.clone()];
        ordered.extend(node_ids.iter().filter(|n| **n != root).cloned());

        let topology = Topology::tree(&ordered, self.config.fanout);
        info!("Spanning tree rooted at {} covers {} node(s).", root, ordered.len());

        *self.layout.write().await = Layout {
            topology,
            root: Some(root),
        };
    }

    async fn handle(&self, src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        match request {
            Payload::Broadcast { message } => {
                self.on_broadcast(&src, message).await?;
                Ok(Payload::BroadcastOk)
            }
            Payload::Gossip { messages } => {
                self.on_gossip(&src, messages).await?;
                Ok(Payload::GossipOk)
            }
            Payload::Read { .. } => Ok(Payload::ReadOk {
                messages: Some(self.on_read().await),
                value: None,
            }),
            Payload::Topology { topology } => {
                self.on_topology(topology).await;
                Ok(Payload::TopologyOk)
            }
            other => Err(not_supported(&other)),
        }
    }
}

async fn flush_periodically<C: Communicator, E: Executor>(this: Weak<Broadcast<C, E>>) {
    let (communicator, interval) = match this.upgrade() {
        Some(this) => (this.communicator.clone(), this.config.flush_interval),
        None => return,
    };

    let me = communicator.await_node_id().await;

    loop {
        futures_timer::Delay::new(interval).await;

        let this = match this.upgrade() {
            Some(this) => this,
            None => return,
        };

        if this.outbox.is_shut_down() {
            return;
        }

        match this.root().await {
            Some(root) if root != me => {
                debug!("{} is not the root, no flushing required.", me);
                return;
            }
            Some(_) => {
                if let Err(err) = this.flush().await {
                    tracing::warn!("Failed to flush buffered values: {}", err);
                }
            }
            None => {}
        }
    }
}
