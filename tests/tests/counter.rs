mod cluster;

use std::sync::Arc;

use futures::executor::block_on;
use glomers::counter::Counter;
use glomers::counter::KEY;
use glomers::error::KvError;
use glomers::kv::Kv;
use glomers::kv::KvClient;
use glomers::prototyping::DirectCommunicator;
use glomers::prototyping::MemoryKv;
use glomers::ErrorCode;
use glomers::Handler;
use glomers::NodeId;
use glomers::Payload;

use cluster::kv_cluster;
use cluster::LostReplies;

type ClusterCounter = Counter<KvClient<DirectCommunicator>>;

fn counter(communicator: &DirectCommunicator) -> ClusterCounter {
    Counter::new(KvClient::sequential(communicator.clone()))
}

#[test]
fn adds_accumulate() {
    let cluster = kv_cluster(3);
    let counters: Vec<_> = cluster.nodes.iter().map(counter).collect();

    block_on(async {
        counters[0].add(3).await.unwrap();
        counters[1].add(-1).await.unwrap();
        counters[2].add(5).await.unwrap();

        for counter in &counters {
            assert_eq!(counter.read().await.unwrap(), 7);
        }
    });
}

#[test]
fn concurrent_adds_are_never_lost() {
    let cluster = kv_cluster(4);

    let writers = cluster
        .nodes
        .iter()
        .map(|c| {
            let counter = counter(c);

            std::thread::spawn(move || {
                block_on(async {
                    for _ in 0..25 {
                        counter.add(2).await.unwrap();
                    }
                })
            })
        })
        .collect::<Vec<_>>();

    for writer in writers {
        writer.join().unwrap();
    }

    let total = block_on(counter(&cluster.nodes[0]).read()).unwrap();
    assert_eq!(total, 4 * 25 * 2);
}

#[test]
fn unanswered_add_is_applied_at_most_once() {
    let counter = Counter::new(LostReplies::new(MemoryKv::new()));

    block_on(async {
        // the swap takes effect but its reply is lost
        assert!(matches!(counter.add(3).await, Err(KvError::Timeout)));
        assert_eq!(counter.read().await.unwrap(), 3);

        counter.add(1).await.unwrap();
        assert_eq!(counter.read().await.unwrap(), 4);
    });
}

#[test]
fn unanswered_add_is_reported_as_timeout() {
    let counter = Counter::new(LostReplies::new(MemoryKv::new()));

    let err = block_on(counter.handle(NodeId::from("c1"), Payload::Add { delta: 2 }))
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::Timeout);
}

#[test]
fn read_does_not_initialize() {
    let cluster = kv_cluster(1);
    let counter = counter(&cluster.nodes[0]);

    block_on(async {
        assert_eq!(counter.read().await.unwrap(), 0);
        assert!(matches!(
            cluster.sequential.read(KEY).await,
            Err(KvError::NotFound)
        ));
    });
}

#[test]
fn handler_answers_counter_requests() {
    let cluster = kv_cluster(1);
    let counter = Arc::new(counter(&cluster.nodes[0]));
    let client = NodeId::from("c1");

    block_on(async {
        let reply = counter
            .handle(client.clone(), Payload::Add { delta: 4 })
            .await
            .unwrap();
        assert_eq!(reply, Payload::AddOk);

        let reply = counter
            .handle(client.clone(), Payload::Read { key: None })
            .await
            .unwrap();
        assert_eq!(reply, Payload::ReadOk {
            messages: None,
            value: Some(4),
        });

        let err = counter
            .handle(client, Payload::Broadcast { message: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotSupported);
    });
}
