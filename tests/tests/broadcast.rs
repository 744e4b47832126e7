mod cluster;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use futures::executor::ThreadPool;
use futures::future::FutureExt;
use futures::stream::StreamExt;
use glomers::broadcast::Broadcast;
use glomers::broadcast::Config;
use glomers::communicator::Communicator;
use glomers::error::SpawnError;
use glomers::executor::Executor;
use glomers::prototyping::DirectCommunicator;
use glomers::prototyping::DirectCommunicators;
use glomers::Handler;
use glomers::NodeId;
use glomers::Payload;
use rand::seq::SliceRandom;

use cluster::eventually;
use cluster::node_ids;

type Node = Arc<Broadcast<DirectCommunicator, ThreadPool>>;

fn spawn_nodes(communicators: &DirectCommunicators, count: usize, config: Config) -> Vec<Node> {
    let pool = ThreadPool::new().unwrap();

    node_ids(count)
        .into_iter()
        .map(|id| {
            let communicator = communicators.create_communicator_for(id.clone());
            let node = Broadcast::spawn(communicator, pool.clone(), config.clone()).unwrap();

            communicators.register(id, Arc::clone(&node));

            node
        })
        .collect()
}

/// Runs tasks on a thread pool unless told to reject them.
#[derive(Clone)]
struct Switchable {
    pool: ThreadPool,
    rejecting: Arc<AtomicBool>,
}

impl Switchable {
    fn new() -> Self {
        Self {
            pool: ThreadPool::new().unwrap(),
            rejecting: Arc::new(AtomicBool::new(false)),
        }
    }

    fn reject(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

impl Executor for Switchable {
    fn execute<F: std::future::Future<Output = ()> + Send + 'static>(
        &self,
        task: F,
    ) -> Result<(), SpawnError> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(SpawnError::Rejected("executor is saturated".into()));
        }

        self.pool.execute(task)
    }
}

fn client() -> NodeId {
    NodeId::from("c1")
}

fn ring(count: usize) -> HashMap<NodeId, Vec<NodeId>> {
    let ids = node_ids(count);

    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let prev = ids[(i + count - 1) % count].clone();
            let next = ids[(i + 1) % count].clone();

            (id.clone(), vec![prev, next])
        })
        .collect()
}

async fn all_have<C, E>(nodes: &[Arc<Broadcast<C, E>>], expected: &BTreeSet<i64>) -> bool
where
    C: Communicator,
    E: Executor,
{
    for node in nodes {
        let seen: BTreeSet<i64> = node.on_read().await.into_iter().collect();

        if &seen != expected {
            return false;
        }
    }

    true
}

fn shut_down(nodes: &[Node]) {
    for node in nodes {
        node.shut_down();
    }
}

#[test]
fn flood_fill_reaches_every_node() {
    let communicators = DirectCommunicators::new();
    let nodes = spawn_nodes(&communicators, 5, Config::flood_fill());

    block_on(async {
        for node in &nodes {
            node.on_topology(ring(5)).await;
        }

        for (i, node) in nodes.iter().enumerate() {
            node.on_broadcast(&client(), i as i64 * 10).await.unwrap();
        }

        let expected: BTreeSet<i64> = (0..5).map(|i| i * 10).collect();

        assert!(eventually(Duration::from_secs(10), || all_have(&nodes, &expected)).await);
    });

    shut_down(&nodes);
}

#[test]
fn repeated_broadcast_is_recorded_once() {
    let communicators = DirectCommunicators::new();
    let nodes = spawn_nodes(&communicators, 1, Config::flood_fill());

    block_on(async {
        let node = &nodes[0];

        for _ in 0..3 {
            let reply = node
                .handle(client(), Payload::Broadcast { message: 7 })
                .await
                .unwrap();
            assert_eq!(reply, Payload::BroadcastOk);
        }

        assert_eq!(node.on_read().await, vec![7]);
    });

    shut_down(&nodes);
}

#[test]
fn flood_fill_only_uses_announced_edges() {
    let communicators = DirectCommunicators::new();
    let mut events = communicators.events();
    let nodes = spawn_nodes(&communicators, 3, Config::flood_fill());

    let topology: HashMap<NodeId, Vec<NodeId>> = HashMap::from([
        ("n0".into(), vec!["n1".into(), "n2".into()]),
        ("n1".into(), vec!["n0".into()]),
        ("n2".into(), vec!["n0".into()]),
    ]);

    block_on(async {
        for node in &nodes {
            node.on_topology(topology.clone()).await;
        }

        nodes[1].on_broadcast(&client(), 42).await.unwrap();

        let expected = BTreeSet::from([42]);
        assert!(eventually(Duration::from_secs(10), || all_have(&nodes, &expected)).await);
    });

    shut_down(&nodes);

    let (n1, n2) = (NodeId::from("n1"), NodeId::from("n2"));
    let mut observed = 0;

    while let Some(Some(event)) = events.next().now_or_never() {
        observed += 1;

        let direct = (event.sender == n1 && event.receiver == n2)
            || (event.sender == n2 && event.receiver == n1);
        assert!(!direct, "unexpected direct transmission: {:?}", event);
    }

    assert!(observed > 0);
}

#[test]
fn tree_converges_despite_packet_loss() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();

    let communicators =
        DirectCommunicators::with_characteristics(0.2, rand_distr::Normal::new(2.0, 1.0).unwrap());

    let config = Config::tree()
        .with_flush_interval(Duration::from_millis(20))
        .with_rpc_timeout(Duration::from_millis(50))
        .with_fanout(3);

    let nodes = spawn_nodes(&communicators, 10, config);

    block_on(async {
        communicators.initialize().await;

        for (i, node) in nodes.iter().enumerate() {
            for j in 0..5 {
                // lost forwards are retried in the background
                node.on_broadcast(&client(), (i * 5 + j) as i64).await.unwrap();
            }
        }

        let expected: BTreeSet<i64> = (0..50).collect();

        assert!(eventually(Duration::from_secs(30), || all_have(&nodes, &expected)).await);
    });

    shut_down(&nodes);
}

#[test]
fn flood_fill_recovers_from_partition() {
    let communicators = DirectCommunicators::new();
    let config = Config::flood_fill().with_rpc_timeout(Duration::from_millis(20));
    let nodes = spawn_nodes(&communicators, 4, config);

    block_on(async {
        for node in &nodes {
            node.on_topology(ring(4)).await;
        }

        let ids = node_ids(4);
        communicators.partition(&ids[..2], &ids[2..]).await;

        let mut values: Vec<i64> = (0..20).collect();
        values.shuffle(&mut rand::thread_rng());

        for (i, value) in values.iter().enumerate() {
            nodes[i % 4].on_broadcast(&client(), *value).await.unwrap();
        }

        let expected: BTreeSet<i64> = values.iter().copied().collect();
        assert!(!all_have(&nodes, &expected).await);

        communicators.heal().await;

        assert!(eventually(Duration::from_secs(10), || all_have(&nodes, &expected)).await);
    });

    shut_down(&nodes);
}

#[test]
fn tree_ignores_announced_topology() {
    let communicators = DirectCommunicators::new();
    let config = Config::tree().with_flush_interval(Duration::from_millis(10));
    let nodes = spawn_nodes(&communicators, 4, config);

    block_on(async {
        communicators.initialize().await;

        // a topology without any edges would isolate every node
        let isolated: HashMap<NodeId, Vec<NodeId>> =
            node_ids(4).into_iter().map(|id| (id, vec![])).collect();
        for node in &nodes {
            node.on_topology(isolated.clone()).await;
        }

        nodes[3].on_broadcast(&client(), 1).await.unwrap();

        let expected = BTreeSet::from([1]);
        assert!(eventually(Duration::from_secs(10), || all_have(&nodes, &expected)).await);
    });

    shut_down(&nodes);
}

#[test]
fn unknown_request_is_rejected() {
    let communicators = DirectCommunicators::new();
    let nodes = spawn_nodes(&communicators, 1, Config::flood_fill());

    let result = block_on(nodes[0].handle(client(), Payload::Add { delta: 1 }));

    assert_eq!(
        result.map_err(|err| err.code()).unwrap_err(),
        glomers::ErrorCode::NotSupported
    );

    shut_down(&nodes);
}

#[test]
fn gossip_that_cannot_be_forwarded_is_not_recorded() {
    let communicators = DirectCommunicators::new();
    let executor = Switchable::new();
    let node = Broadcast::spawn(
        communicators.create_communicator_for("n0"),
        executor.clone(),
        Config::flood_fill(),
    )
    .unwrap();

    let topology: HashMap<NodeId, Vec<NodeId>> =
        HashMap::from([("n0".into(), vec!["n1".into(), "n2".into()])]);

    block_on(async {
        node.on_topology(topology).await;

        executor.reject(true);

        let err = node
            .handle("n1".into(), Payload::Gossip {
                messages: vec![1, 2],
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), glomers::ErrorCode::TemporarilyUnavailable);
        assert!(node.on_read().await.is_empty());

        executor.reject(false);

        let reply = node
            .handle("n1".into(), Payload::Gossip {
                messages: vec![1, 2],
            })
            .await
            .unwrap();
        assert_eq!(reply, Payload::GossipOk);
        assert_eq!(node.on_read().await, vec![1, 2]);
    });

    node.shut_down();
}

#[test]
fn flush_keeps_batch_that_cannot_be_forwarded() {
    let communicators = DirectCommunicators::new();
    let executor = Switchable::new();
    let config = Config::tree().with_flush_interval(Duration::from_secs(3600));

    let nodes: Vec<Arc<Broadcast<DirectCommunicator, Switchable>>> = node_ids(2)
        .into_iter()
        .map(|id| {
            let communicator = communicators.create_communicator_for(id.clone());
            let node = Broadcast::spawn(communicator, executor.clone(), config.clone()).unwrap();

            communicators.register(id, Arc::clone(&node));

            node
        })
        .collect();

    block_on(async {
        communicators.initialize().await;

        let root = &nodes[0];
        root.on_broadcast(&client(), 5).await.unwrap();

        executor.reject(true);
        assert!(root.flush().await.is_err());
        assert!(root.on_read().await.is_empty());

        executor.reject(false);
        assert_eq!(root.flush().await.unwrap(), 1);

        let expected = BTreeSet::from([5]);
        assert!(eventually(Duration::from_secs(10), || all_have(&nodes, &expected)).await);
    });

    for node in &nodes {
        node.shut_down();
    }
}
