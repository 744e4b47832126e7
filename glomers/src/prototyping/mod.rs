//! An in-process cluster for tests and experiments.
//!
//! [`DirectCommunicators`] connects [`Handler`]s directly, without any
//! serialization, but simulates an unreliable network: each message may be
//! delayed according to a normal distribution and dropped with a given
//! probability, both configurable per directed link. Every transmission is
//! reported to [event listeners][DirectCommunicators::events].
//!
//! [`MemoryKv`] stands in for the key-value services. Register it under the
//! service's node id, e.g. [`Consistency::service`][crate::kv::Consistency::service].
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::Stream;

use crate::communicator::Communicator;
use crate::error::KvError;
use crate::error::RequestError;
use crate::error::RpcError;
use crate::executor::Executor;
use crate::executor::StdThread;
use crate::handler::answer;
use crate::handler::not_supported;
use crate::handler::Handler;
use crate::kv::Kv;
use crate::message::Payload;
use crate::util::deadline;
use crate::NodeId;

type Handlers = HashMap<NodeId, Arc<dyn Handler>>;
type EventListeners = Vec<mpsc::UnboundedSender<DirectCommunicatorEvent>>;
type PacketLossRates = HashMap<(NodeId, NodeId), f32>;
type E2eDelays = HashMap<(NodeId, NodeId), rand_distr::Normal<f32>>;

#[derive(Clone, Debug)]
pub struct DirectCommunicatorEvent {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub e2e_delay: Duration,
    pub dropped: bool,
    pub payload: Payload,
}

#[derive(Clone)]
pub struct DirectCommunicators {
    handlers: Arc<Mutex<Handlers>>,
    members: Arc<Mutex<Vec<NodeId>>>,
    default_packet_loss: f32,
    default_e2e_delay: rand_distr::Normal<f32>,
    packet_loss: Arc<Mutex<PacketLossRates>>,
    e2e_delay: Arc<Mutex<E2eDelays>>,
    event_listeners: Arc<Mutex<EventListeners>>,
}

impl DirectCommunicators {
    pub fn new() -> Self {
        Self::with_characteristics(0.0, no_delay())
    }

    pub fn with_characteristics(packet_loss: f32, e2e_delay: rand_distr::Normal<f32>) -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            members: Arc::new(Mutex::new(Vec::new())),
            default_packet_loss: packet_loss,
            default_e2e_delay: e2e_delay,
            packet_loss: Arc::new(Mutex::new(HashMap::new())),
            e2e_delay: Arc::new(Mutex::new(HashMap::new())),
            event_listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn set_packet_loss(&self, from: NodeId, to: NodeId, packet_loss: f32) {
        let mut link = self.packet_loss.lock().await;
        link.insert((from, to), packet_loss);
    }

    pub async fn set_delay(&self, from: NodeId, to: NodeId, delay: rand_distr::Normal<f32>) {
        let mut link = self.e2e_delay.lock().await;
        link.insert((from, to), delay);
    }

    /// Drops every message between `side` and `other_side`, in both
    /// directions, until [healed][Self::heal].
    pub async fn partition(&self, side: &[NodeId], other_side: &[NodeId]) {
        let mut link = self.packet_loss.lock().await;

        for a in side {
            for b in other_side {
                link.insert((a.clone(), b.clone()), 1.0);
                link.insert((b.clone(), a.clone()), 1.0);
            }
        }
    }

    /// Restores the default packet loss on every link.
    pub async fn heal(&self) {
        self.packet_loss.lock().await.clear();
    }

    /// Makes `handler` reachable as `node_id`.
    ///
    /// Services such as [`MemoryKv`] are registered without becoming members
    /// of the cluster.
    pub fn register<H: Handler>(&self, node_id: impl Into<NodeId>, handler: H) {
        let mut handlers = self.handlers.lock_blocking();
        handlers.insert(node_id.into(), Arc::new(handler));
    }

    pub fn events(&self) -> impl Stream<Item = DirectCommunicatorEvent> {
        let (send, recv) = mpsc::unbounded();

        let mut listeners = self.event_listeners.lock_blocking();
        listeners.push(send);

        recv
    }

    /// Creates the communicator of cluster member `node_id`.
    pub fn create_communicator_for(&self, node_id: impl Into<NodeId>) -> DirectCommunicator {
        let node_id = node_id.into();

        let mut members = self.members.lock_blocking();
        if !members.contains(&node_id) {
            members.push(node_id.clone());
        }

        DirectCommunicator {
            set: self.clone(),
            node_id,
        }
    }

    /// Initializes the handlers of all members, as `init` would.
    pub async fn initialize(&self) {
        let members = self.members.lock().await.clone();

        for member in &members {
            let handler = self.handlers.lock().await.get(member).cloned();

            if let Some(handler) = handler {
                handler.init(member, &members).await;
            }
        }
    }

    async fn link_characteristics(
        &self,
        from: &NodeId,
        to: &NodeId,
    ) -> (f32, rand_distr::Normal<f32>) {
        let link = (from.clone(), to.clone());

        let packet_loss = self.packet_loss.lock().await.get(&link).copied();
        let e2e_delay = self.e2e_delay.lock().await.get(&link).copied();

        (
            packet_loss.unwrap_or(self.default_packet_loss),
            e2e_delay.unwrap_or(self.default_e2e_delay),
        )
    }

    /// Simulates a single transmission. Returns `false` if it got lost.
    async fn transmit(&self, sender: &NodeId, receiver: &NodeId, payload: &Payload) -> bool {
        let (packet_loss, e2e_delay) = self.link_characteristics(sender, receiver).await;

        let e2e_delay = delay(&e2e_delay);
        let dropped = roll_for_failure(packet_loss);

        {
            let mut listeners = self.event_listeners.lock().await;
            listeners.retain(|l| {
                l.unbounded_send(DirectCommunicatorEvent {
                    sender: sender.clone(),
                    receiver: receiver.clone(),
                    e2e_delay,
                    dropped,
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }

        futures_timer::Delay::new(e2e_delay).await;

        !dropped
    }
}

impl Default for DirectCommunicators {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DirectCommunicators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectCommunicators")
            .field("default_packet_loss", &self.default_packet_loss)
            .field("default_e2e_delay", &self.default_e2e_delay)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub struct DirectCommunicator {
    set: DirectCommunicators,
    node_id: NodeId,
}

impl DirectCommunicator {
    /// Delivers `payload` and its reply. Resolves to `None` if either got
    /// lost.
    async fn deliver(&self, dest: &NodeId, payload: Payload) -> Option<Result<Payload, RpcError>> {
        if !self.set.transmit(&self.node_id, dest, &payload).await {
            return None;
        }

        let handler = self.set.handlers.lock().await.get(dest).cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => return Some(Err(RpcError::Unreachable(dest.clone()))),
        };

        let reply = answer(&*handler, self.node_id.clone(), payload).await;

        if !self.set.transmit(dest, &self.node_id, &reply).await {
            return None;
        }

        Some(Ok(reply))
    }
}

#[async_trait]
impl Communicator for DirectCommunicator {
    fn node_id(&self) -> Option<NodeId> {
        Some(self.node_id.clone())
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.set.members.lock_blocking().clone()
    }

    fn send(&self, dest: &NodeId, payload: Payload) -> Result<(), RpcError> {
        let this = self.clone();
        let dest = dest.clone();

        if let Err(err) = StdThread.execute(async move {
            let _ = this.deliver(&dest, payload).await;
        }) {
            tracing::warn!("Message was lost before it was sent: {}", err);
        }

        Ok(())
    }

    async fn rpc(
        &self,
        dest: &NodeId,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, RpcError> {
        let delivery = async {
            match self.deliver(dest, payload).await {
                Some(result) => result,
                None => futures::future::pending().await,
            }
        };

        deadline(delivery, timeout)
            .await
            .unwrap_or(Err(RpcError::Timeout))
    }
}

/// A key-value service kept in memory.
///
/// Trivially linearizable, so it may stand in for either consistency level.
#[derive(Debug, Default)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn read(&self, key: &str) -> Result<i64, KvError> {
        let values = self.values.lock().await;
        values.get(key).copied().ok_or(KvError::NotFound)
    }

    async fn write(&self, key: &str, value: i64) -> Result<(), KvError> {
        let mut values = self.values.lock().await;
        values.insert(key.to_owned(), value);

        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: i64,
        to: i64,
        create_if_missing: bool,
    ) -> Result<(), KvError> {
        let mut values = self.values.lock().await;

        match values.get_mut(key) {
            Some(current) if *current == from => {
                *current = to;
                Ok(())
            }
            Some(_) => Err(KvError::PreconditionFailed),
            None if create_if_missing => {
                values.insert(key.to_owned(), to);
                Ok(())
            }
            None => Err(KvError::NotFound),
        }
    }
}

#[async_trait]
impl Handler for MemoryKv {
    async fn handle(&self, _src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        match request {
            Payload::Read { key: Some(key) } => Ok(Payload::ReadOk {
                messages: None,
                value: Some(Kv::read(self, &key).await?),
            }),
            Payload::Read { key: None } => Err(RequestError::Malformed("missing key".to_owned())),
            Payload::Write { key, value } => {
                Kv::write(self, &key, value).await?;
                Ok(Payload::WriteOk)
            }
            Payload::Cas {
                key,
                from,
                to,
                create_if_not_exists,
            } => {
                self.compare_and_swap(&key, from, to, create_if_not_exists)
                    .await?;
                Ok(Payload::CasOk)
            }
            other => Err(not_supported(&other)),
        }
    }
}

/// Delay distribution of a link that delivers instantly.
pub fn no_delay() -> rand_distr::Normal<f32> {
    rand_distr::Normal::new(0.0, 0.0).expect("zero is a valid standard deviation")
}

fn roll_for_failure(rate: f32) -> bool {
    use rand::Rng;

    rand::thread_rng().gen::<f32>() < rate
}

fn delay(distr: &rand_distr::Normal<f32>) -> Duration {
    use rand::distributions::Distribution;

    let delay_ms = distr.sample(&mut rand::thread_rng());
    let delay_ms = delay_ms as u64;

    Duration::from_millis(delay_ms)
}
