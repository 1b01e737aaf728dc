//! Fan-out under concurrent writes: every subscriber sees every update to
//! its key exactly once, in order, starting right after its snapshot.

mod common;

use common::{canary, canary_port, init_tracing, instance, redis_subject};
use parking_lot::Mutex;
use statefeed::{
    BackoffConfig, CancelToken, ConnectionPool, EventKind, EventPublisher, Index, LogConfig,
    Mutation, PublisherConfig, Server, ServerConfig, ServerResolver, Subject, SubscribeRequest,
    TlsConfigurator, Topic,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SUBSCRIBERS: usize = 5;
const UPDATES_PER_SUBSCRIBER: usize = 300;
const BURST_SIZE: usize = 1000;
/// Instances on the subscribed key before any subscriber starts, so every
/// snapshot takes a while to materialize and send.
const PREREGISTERED: usize = 1000;

struct Received {
    snapshot_index: Index,
    indices: Vec<Index>,
}

#[test]
fn test_delivers_all_messages_under_concurrent_writes() {
    init_tracing();

    let publisher = Arc::new(
        EventPublisher::new(PublisherConfig {
            // Large enough that no subscriber is ever forced to resnapshot.
            log: LogConfig {
                max_retained: 1 << 20,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap(),
    );
    let resolver = Arc::new(ServerResolver::new());
    let server = Arc::new(Server::new(
        ServerConfig::default(),
        Arc::clone(&publisher),
        Arc::new(TlsConfigurator::insecure()),
    ));
    resolver.register(Arc::clone(&server)).unwrap();
    let pool = ConnectionPool::new(
        Arc::clone(&resolver),
        Arc::new(TlsConfigurator::insecure()),
        BackoffConfig::default(),
    )
    .unwrap();
    let conn = pool.client_conn("dc1").unwrap();

    for i in 0..PREREGISTERED {
        publisher
            .apply(
                &redis_subject(),
                Mutation::Upsert(instance(
                    &format!("node{}", i % 50),
                    "redis",
                    &format!("redis-{}", i),
                    8080,
                )),
            )
            .unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let written: Arc<Mutex<Vec<Index>>> = Arc::new(Mutex::new(Vec::new()));

    // Canary writer: the port counts the updates, so a missed or repeated
    // update shows up as a port jump.
    let writer = {
        let publisher = Arc::clone(&publisher);
        let stop = Arc::clone(&stop);
        let written = Arc::clone(&written);
        thread::spawn(move || {
            let mut port = 0u32;
            while !stop.load(Ordering::SeqCst) {
                let event = publisher
                    .apply(&redis_subject(), Mutation::Upsert(canary(port)))
                    .unwrap();
                written.lock().push(event.index);
                port += 1;
            }
            port
        })
    };

    // Unrelated registrations competing for indices and registry shards.
    let burst = {
        let publisher = Arc::clone(&publisher);
        thread::spawn(move || {
            for i in 0..BURST_SIZE {
                let subject = Subject::new(Topic::ServiceHealth, format!("burst-{}", i));
                publisher
                    .apply(
                        &subject,
                        Mutation::Upsert(instance("node2", &format!("burst-{}", i), "b1", 9000)),
                    )
                    .unwrap();
            }
        })
    };

    let subscribers: Vec<_> = (0..SUBSCRIBERS)
        .map(|n| {
            let conn = Arc::clone(&conn);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5 * n as u64));
                let request = SubscribeRequest::new(Topic::ServiceHealth, "redis");
                let cancel = CancelToken::with_timeout(Duration::from_secs(60));
                let mut stream = conn.subscribe(&request, &cancel).unwrap();

                let mut snapshot_canary = None;
                let mut snapshot_entries = 0;
                let snapshot_index = loop {
                    let event = stream.recv().unwrap().expect("stream ended during snapshot");
                    if event.is_end_of_snapshot() {
                        break event.index;
                    }
                    snapshot_entries += 1;
                    if let Some(port) = event.payload.as_ref().and_then(canary_port) {
                        snapshot_canary = Some(port);
                    }
                };

                assert!(
                    snapshot_entries >= PREREGISTERED,
                    "subscriber {} saw {} snapshot entries",
                    n,
                    snapshot_entries
                );

                // Either the snapshot holds port P and the stream starts at
                // P+1, or it holds no canary and the stream starts at 0.
                let mut expected_port = snapshot_canary.map(|p| p + 1).unwrap_or(0);
                let mut indices = Vec::with_capacity(UPDATES_PER_SUBSCRIBER);

                while indices.len() < UPDATES_PER_SUBSCRIBER {
                    let event = stream.recv().unwrap().expect("stream ended early");
                    assert_eq!(
                        event.kind,
                        EventKind::Upsert,
                        "subscriber {} got unexpected {:?}",
                        n,
                        event.kind
                    );
                    let port = event
                        .payload
                        .as_ref()
                        .and_then(canary_port)
                        .expect("only the canary is written after the snapshot");
                    assert_eq!(port, expected_port, "subscriber {} skipped or repeated", n);
                    expected_port += 1;
                    indices.push(event.index);
                }

                // Teardown may only fail with cancellation.
                cancel.cancel();
                match stream.recv() {
                    Err(e) => assert!(e.is_cancellation(), "teardown error: {}", e),
                    Ok(other) => panic!("expected cancellation, got {:?}", other),
                }

                Received {
                    snapshot_index,
                    indices,
                }
            })
        })
        .collect();

    let results: Vec<Received> = subscribers.into_iter().map(|h| h.join().unwrap()).collect();
    stop.store(true, Ordering::SeqCst);
    let total_writes = writer.join().unwrap();
    burst.join().unwrap();

    let written = written.lock().clone();
    assert_eq!(written.len() as u32, total_writes);

    for (n, received) in results.iter().enumerate() {
        // Strictly increasing.
        assert!(received.indices.windows(2).all(|w| w[0] < w[1]));

        // Exactly the indices the store assigned to the key, no gaps.
        let expected: Vec<Index> = written
            .iter()
            .copied()
            .filter(|i| *i > received.snapshot_index)
            .take(received.indices.len())
            .collect();
        assert_eq!(received.indices, expected, "subscriber {} diverged", n);
    }

    server.shutdown();
}
