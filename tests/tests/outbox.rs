mod cluster;

use std::collections::BTreeSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::executor::block_on;
use futures::executor::ThreadPool;
use glomers::prototyping::DirectCommunicator;
use glomers::prototyping::DirectCommunicators;
use glomers::retry::Outbox;
use glomers::Handler;
use glomers::NodeId;
use glomers::Payload;
use glomers::RequestError;

use cluster::eventually;

/// Records delivered values, optionally turning the first deliveries away.
#[derive(Default)]
struct Recorder {
    received: Mutex<BTreeSet<i64>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    refusals: AtomicUsize,
}

impl Recorder {
    fn refusing(refusals: usize) -> Self {
        Self {
            refusals: AtomicUsize::new(refusals),
            ..Self::default()
        }
    }

    fn received(&self) -> BTreeSet<i64> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, _src: NodeId, request: Payload) -> Result<Payload, RequestError> {
        let refuse = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(RequestError::Unavailable("busy".to_owned()));
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        futures_timer::Delay::new(Duration::from_millis(20)).await;

        let values = match request {
            Payload::Broadcast { message } => vec![message],
            Payload::Gossip { messages } => messages,
            _ => vec![],
        };
        self.received.lock().unwrap().extend(values);

        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(Payload::GossipOk)
    }
}

type Setup = (
    DirectCommunicators,
    Arc<Recorder>,
    Outbox<DirectCommunicator, ThreadPool>,
);

fn setup(recorder: Recorder, max_in_flight: usize) -> Setup {
    let communicators = DirectCommunicators::new();
    let recorder = Arc::new(recorder);

    communicators.register("n1", Arc::clone(&recorder));

    let outbox = Outbox::new(
        communicators.create_communicator_for("n0"),
        ThreadPool::new().unwrap(),
        Duration::from_millis(30),
        max_in_flight,
    )
    .with_retry_pause(Duration::from_millis(5));

    (communicators, recorder, outbox)
}

async fn has_received(recorder: &Recorder, expected: &BTreeSet<i64>) -> bool {
    &recorder.received() == expected
}

fn n1() -> NodeId {
    NodeId::from("n1")
}

#[test]
fn deliveries_in_flight_are_capped() {
    let (_communicators, recorder, outbox) = setup(Recorder::default(), 2);

    block_on(async {
        for value in 0..10 {
            outbox
                .post(n1(), Payload::Broadcast { message: value })
                .await
                .unwrap();
        }

        let expected: BTreeSet<i64> = (0..10).collect();
        assert!(eventually(Duration::from_secs(10), || has_received(&recorder, &expected)).await);
    });

    let peak = recorder.peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "{} deliveries were in flight", peak);

    outbox.shut_down();
}

#[test]
fn gossip_for_unreachable_node_is_merged() {
    let (communicators, recorder, outbox) = setup(Recorder::default(), 1);

    block_on(async {
        communicators.partition(&[NodeId::from("n0")], &[n1()]).await;

        for value in 0..100 {
            outbox
                .post(n1(), Payload::Gossip {
                    messages: vec![value],
                })
                .await
                .unwrap();

            assert!(outbox.backlog(&n1()).await <= 1);
        }

        communicators.heal().await;

        let expected: BTreeSet<i64> = (0..100).collect();
        assert!(eventually(Duration::from_secs(10), || has_received(&recorder, &expected)).await);
        assert_eq!(outbox.backlog(&n1()).await, 0);
    });

    outbox.shut_down();
}

#[test]
fn shut_down_stops_deliveries() {
    let (communicators, recorder, outbox) = setup(Recorder::default(), 4);

    block_on(async {
        communicators.partition(&[NodeId::from("n0")], &[n1()]).await;

        outbox
            .post(n1(), Payload::Gossip { messages: vec![1] })
            .await
            .unwrap();

        outbox.shut_down();
        assert!(outbox.is_shut_down());

        outbox
            .post(n1(), Payload::Gossip { messages: vec![2] })
            .await
            .unwrap();

        communicators.heal().await;
        futures_timer::Delay::new(Duration::from_millis(300)).await;
    });

    assert!(recorder.received().is_empty());
}

#[test]
fn temporarily_unavailable_is_not_an_acknowledgement() {
    let (_communicators, recorder, outbox) = setup(Recorder::refusing(3), 1);

    block_on(async {
        outbox
            .post(n1(), Payload::Gossip { messages: vec![7] })
            .await
            .unwrap();

        let expected = BTreeSet::from([7]);
        assert!(eventually(Duration::from_secs(10), || has_received(&recorder, &expected)).await);
    });

    assert_eq!(recorder.refusals.load(Ordering::SeqCst), 0);

    outbox.shut_down();
}
