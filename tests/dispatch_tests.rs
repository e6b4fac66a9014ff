//! Tests for registration, stream attachment and the multiplexing loop.

use std::time::Duration;

use rand::Rng;
use tonic::Status;

use sigma_dispatch::auth::Credentials;
use sigma_dispatch::connection::{CloseOutcome, ConnectionState, DEFAULT_QUEUE_CAPACITY};
use sigma_dispatch::dispatch::STREAM_WRITE_BUFFER;
use sigma_dispatch::error::DispatchError;
use sigma_dispatch::proto::DispatchEvent;
use sigma_dispatch::spec::{FunctionSpec, ParameterValue};

use test_harness::{
    assert_eventually, credentials, new_dispatcher, registered_node, result, spawn_subscribe,
    termination, SECRET, URN,
};

// ==================== Register ====================

#[tokio::test]
async fn test_register_returns_prepared_spec() {
    let dispatcher = new_dispatcher();
    let spec = FunctionSpec::new("function handler(x) { return x; }")
        .with_parameter("timeout_ms", ParameterValue::Int(5000))
        .with_parameter("mode", ParameterValue::String("fast".to_string()));
    dispatcher
        .prepare("urn:node:1", "s3cr3t", spec.clone())
        .await
        .unwrap();

    // Wrong secret is rejected and does not consume the registration.
    let err = dispatcher
        .register(&Credentials::new("urn:node:1", "wrong"), "js")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidSecret(_)));

    let returned = dispatcher
        .register(&Credentials::new("urn:node:1", "s3cr3t"), "js")
        .await
        .unwrap();
    assert_eq!(returned, spec);

    let err = dispatcher
        .register(&Credentials::new("urn:node:1", "s3cr3t"), "js")
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyRegistered(_)));
}

#[tokio::test]
async fn test_register_requires_node_type() {
    let dispatcher = new_dispatcher();
    dispatcher
        .prepare(URN, SECRET, FunctionSpec::default())
        .await
        .unwrap();

    let err = dispatcher.register(&credentials(), "").await.unwrap_err();
    assert!(matches!(err, DispatchError::MissingNodeType));

    let conn = dispatcher.registry().get(URN).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Pending);
}

#[tokio::test]
async fn test_register_unknown_urn() {
    let dispatcher = new_dispatcher();
    let err = dispatcher.register(&credentials(), "js").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownIdentity(ref urn) if urn == URN));
}

#[tokio::test]
async fn test_register_rejected_after_stream_cycles() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;

    for _ in 0..3 {
        let (worker, handle) = spawn_subscribe(dispatcher.clone());
        let probe = conn.clone();
        assert_eventually(
            || async { probe.is_connected() },
            Duration::from_secs(1),
            "stream should attach",
        )
        .await;
        drop(worker);
        assert!(matches!(
            termination(handle).await,
            DispatchError::StreamFailed(_)
        ));
    }

    let err = dispatcher.register(&credentials(), "js").await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyRegistered(_)));
}

// ==================== Subscribe guards ====================

#[tokio::test]
async fn test_subscribe_requires_registration() {
    let dispatcher = new_dispatcher();
    dispatcher
        .prepare(URN, SECRET, FunctionSpec::default())
        .await
        .unwrap();

    let (_worker, handle) = spawn_subscribe(dispatcher.clone());
    assert!(matches!(
        termination(handle).await,
        DispatchError::NotRegistered(_)
    ));
}

#[tokio::test]
async fn test_subscribe_invalid_secret() {
    let dispatcher = new_dispatcher();
    registered_node(&dispatcher).await;

    let err = dispatcher
        .attach(&Credentials::new(URN, "nope"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, DispatchError::InvalidSecret(_)));
}

/// Two concurrent subscribes: exactly one attaches, the other is rejected.
/// Repeated with random start offsets to shake out check-then-set races.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribe_exactly_one_wins() {
    for trial in 0..50 {
        let dispatcher = new_dispatcher();
        let conn = registered_node(&dispatcher).await;

        let (delay_a, delay_b) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..500u64), rng.gen_range(0..500u64))
        };

        let d = dispatcher.clone();
        let (worker_a, inbound_a, outbound_a) = test_harness::duplex();
        let a = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(delay_a)).await;
            d.subscribe(&credentials(), inbound_a, outbound_a).await
        });
        let d = dispatcher.clone();
        let (worker_b, inbound_b, outbound_b) = test_harness::duplex();
        let b = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_micros(delay_b)).await;
            d.subscribe(&credentials(), inbound_b, outbound_b).await
        });

        // The loser returns immediately; the winner keeps streaming.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !a.is_finished() && !b.is_finished() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "trial {}: neither subscribe was rejected",
                trial
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let (loser, winner) = if a.is_finished() { (a, b) } else { (b, a) };

        assert!(
            matches!(termination(loser).await, DispatchError::AlreadyConnected(_)),
            "trial {}: loser should see AlreadyConnected",
            trial
        );
        assert!(!winner.is_finished(), "trial {}: winner ended early", trial);
        assert_eq!(conn.state(), ConnectionState::Streaming);

        dispatcher.remove(URN).await.unwrap();
        assert!(
            matches!(termination(winner).await, DispatchError::Closed(_)),
            "trial {}: winner should end with Closed",
            trial
        );
        drop((worker_a, worker_b));
    }
}

// ==================== Multiplexing ====================

#[tokio::test]
async fn test_requests_and_results_keep_order() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (mut worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    let mut results = conn.take_results().expect("results receiver");

    for i in 0..10 {
        conn.dispatch(DispatchEvent::with_payload(format!("req-{}", i)))
            .await
            .unwrap();
    }
    for i in 0..10 {
        let event = worker.next_event().await;
        assert_eq!(event.payload, format!("req-{}", i).into_bytes());
    }

    for i in 0..10 {
        worker
            .results
            .send(Ok(result(&format!("res-{}", i))))
            .await
            .unwrap();
    }
    for i in 0..10 {
        let received = tokio::time::timeout(Duration::from_secs(1), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, format!("res-{}", i));
    }

    dispatcher.remove(URN).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
}

#[tokio::test]
async fn test_remove_terminates_blocked_loop() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (_worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;
    let mut results = conn.take_results().unwrap();

    dispatcher.remove(URN).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
    assert_eq!(conn.state(), ConnectionState::Closed);

    // The inbound queue drains to end-of-stream once the reader is gone.
    let end = tokio::time::timeout(Duration::from_secs(1), results.recv())
        .await
        .unwrap();
    assert!(end.is_none());

    // The entry is gone, so both worker calls now fail lookup.
    let err = dispatcher.register(&credentials(), "js").await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownIdentity(_)));
    let (_worker, handle) = spawn_subscribe(dispatcher.clone());
    assert!(matches!(
        termination(handle).await,
        DispatchError::UnknownIdentity(_)
    ));
}

#[tokio::test]
async fn test_stream_error_allows_resubscribe() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;

    let (worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    worker
        .results
        .send(Err(Status::unavailable("connection reset")))
        .await
        .unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::StreamFailed(_)
    ));
    assert_eq!(conn.state(), ConnectionState::Registered);

    // Reconnect immediately with the same credentials.
    let (mut worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should reattach",
    )
    .await;

    conn.dispatch(DispatchEvent::with_payload("after reconnect"))
        .await
        .unwrap();
    assert_eq!(worker.next_event().await.payload, b"after reconnect");

    dispatcher.remove(URN).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
}

#[tokio::test]
async fn test_end_of_stream_is_stream_failure() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;

    let (worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    drop(worker.results);
    assert!(matches!(
        termination(handle).await,
        DispatchError::StreamFailed(_)
    ));
    assert!(!conn.is_connected());
}

#[tokio::test]
async fn test_terminated_request_queue_ends_loop() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;

    let (_worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    conn.terminate_requests();
    assert!(matches!(
        termination(handle).await,
        DispatchError::ChannelTerminated(_)
    ));
    assert_eq!(conn.state(), ConnectionState::Registered);
}

#[tokio::test]
async fn test_write_failure_ends_loop() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;

    let (worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    // Hang up the write side but keep the read side open.
    let test_harness::FakeWorker { results, events } = worker;
    drop(events);

    conn.dispatch(DispatchEvent::with_payload("lost")).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::SendFailed(_)
    ));
    drop(results);
}

#[tokio::test]
async fn test_abort_detaches_stream() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;

    let (_worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    handle.abort();
    let probe = conn.clone();
    assert_eventually(
        || async { !probe.is_connected() },
        Duration::from_secs(1),
        "aborted subscribe should detach its queue pair",
    )
    .await;
    assert_eq!(conn.state(), ConnectionState::Registered);
}

// ==================== Queue bounds ====================

#[tokio::test]
async fn test_outstanding_requests_bounded_by_queue() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (_worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    // The worker never reads, so the loop stalls on its first unbuffered write.
    let mut accepted = 0;
    loop {
        let event = DispatchEvent::with_payload(format!("req-{}", accepted));
        match tokio::time::timeout(Duration::from_millis(100), conn.dispatch(event)).await {
            Ok(sent) => {
                sent.unwrap();
                accepted += 1;
            }
            Err(_) => break,
        }
        assert!(accepted <= 2 * DEFAULT_QUEUE_CAPACITY, "producer never blocked");
    }

    // Full queue, one request held by the loop, and the write buffer.
    assert_eq!(accepted, DEFAULT_QUEUE_CAPACITY + 1 + STREAM_WRITE_BUFFER);

    dispatcher.remove(URN).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
}

#[tokio::test]
async fn test_blocked_producer_sees_closed_after_remove() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (_worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    let producer = {
        let conn = conn.clone();
        tokio::spawn(async move {
            for i in 0..2 * DEFAULT_QUEUE_CAPACITY {
                conn.dispatch(DispatchEvent::with_payload(format!("req-{}", i)))
                    .await?;
            }
            Ok::<(), DispatchError>(())
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!producer.is_finished(), "producer should block on a full queue");

    assert_eq!(
        dispatcher.remove(URN).await.unwrap(),
        CloseOutcome::Detached
    );
    let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
        .await
        .expect("remove should wake the blocked producer")
        .unwrap();
    assert!(
        matches!(outcome, Err(DispatchError::Closed(_))),
        "got {:?}",
        outcome
    );
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
}

#[tokio::test]
async fn test_inbound_queue_blocks_reader_without_dropping() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    let test_harness::FakeWorker {
        results,
        events: _events,
    } = worker;
    let total = DEFAULT_QUEUE_CAPACITY + 50;
    let feeder = tokio::spawn(async move {
        for i in 0..total {
            results
                .send(Ok(result(&format!("res-{}", i))))
                .await
                .unwrap();
        }
        results
    });

    // Nobody consumes yet: the reader must wait instead of discarding.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!feeder.is_finished(), "reader should block on a full queue");
    assert!(conn.is_connected());

    let mut inbound = conn.take_results().unwrap();
    for i in 0..total {
        let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .expect("timed out waiting for result")
            .expect("result queue closed");
        assert_eq!(received.id, format!("res-{}", i));
    }

    let _results = tokio::time::timeout(Duration::from_secs(1), feeder)
        .await
        .expect("feeder should finish once the queue drains")
        .unwrap();

    dispatcher.remove(URN).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
}

#[tokio::test]
async fn test_no_result_delivered_after_remove() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;
    let mut inbound = conn.take_results().unwrap();

    // Fill the queue and leave the reader holding one more result.
    for i in 0..=DEFAULT_QUEUE_CAPACITY {
        worker
            .results
            .send(Ok(result(&format!("res-{}", i))))
            .await
            .unwrap();
    }
    assert_eventually(
        || async { worker.results.capacity() == worker.results.max_capacity() },
        Duration::from_secs(1),
        "reader should pull every result off the stream",
    )
    .await;

    assert_eq!(
        dispatcher.remove(URN).await.unwrap(),
        CloseOutcome::Detached
    );
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));

    let mut delivered = Vec::new();
    while let Some(received) = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .expect("inbound queue should end after remove")
    {
        delivered.push(received.id);
    }
    let expected: Vec<String> = (0..DEFAULT_QUEUE_CAPACITY)
        .map(|i| format!("res-{}", i))
        .collect();
    assert_eq!(delivered, expected);
}

#[tokio::test]
async fn test_dropped_result_consumer_ends_stream() {
    let dispatcher = new_dispatcher();
    let conn = registered_node(&dispatcher).await;
    let (worker, handle) = spawn_subscribe(dispatcher.clone());

    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should attach",
    )
    .await;

    drop(conn.take_results().unwrap());
    worker.results.send(Ok(result("orphan"))).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::StreamFailed(_)
    ));
    assert_eq!(conn.state(), ConnectionState::Registered);

    // A fresh subscribe gets a fresh queue pair.
    let (worker, handle) = spawn_subscribe(dispatcher.clone());
    let probe = conn.clone();
    assert_eventually(
        || async { probe.is_connected() },
        Duration::from_secs(1),
        "stream should reattach",
    )
    .await;
    let mut inbound = conn.take_results().unwrap();
    worker.results.send(Ok(result("fresh"))).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id, "fresh");

    dispatcher.remove(URN).await.unwrap();
    assert!(matches!(
        termination(handle).await,
        DispatchError::Closed(_)
    ));
}
