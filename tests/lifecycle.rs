//! Connection Lifecycle Integration Tests
//!
//! Close frames, idempotent teardown, idle eviction and shutdown.


use bytes::Bytes;
use edgews_protocol::{Opcode, close_code};
use edgews_transport::{ConnState, EngineConfig};
use integration_harness::{
    Event, client_frame, connect_ws, expect_silence, next_event, start_engine, start_engine_with,
    wait_for_eof,
};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

/// Test: Close frame reports its code and reason exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_frame() {
    let (engine, mut events) = start_engine(EngineConfig::default()).await;
    let mut stream = connect_ws(engine.local_addr()).await;
    let Event::Connect(id) = next_event(&mut events, 5).await else {
        panic!("expected connect");
    };
    let conn = engine.connection(id).expect("registered");

    let mut payload = 1000u16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"bye");
    stream.write_all(&client_frame(Opcode::Close, &payload)).await.unwrap();

    assert_eq!(
        next_event(&mut events, 5).await,
        Event::Close(id, 1000, Bytes::from_static(b"bye"))
    );
    assert!(wait_for_eof(&mut stream).await);
    assert_eq!(conn.state(), ConnState::Closed);
    assert_eq!(engine.connection_count(), 0);

    // A second close is a no-op
    assert!(!engine.close_connection(id).await);
    expect_silence(&mut events, 200).await;

    engine.close().await;
}

/// Test: Empty close payload means no status received
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_without_status() {
    let (engine, mut events) = start_engine(EngineConfig::default()).await;
    let mut stream = connect_ws(engine.local_addr()).await;
    let Event::Connect(id) = next_event(&mut events, 5).await else {
        panic!("expected connect");
    };

    stream.write_all(&client_frame(Opcode::Close, &[])).await.unwrap();
    assert_eq!(
        next_event(&mut events, 5).await,
        Event::Close(id, close_code::NO_STATUS_RECEIVED, Bytes::new())
    );

    engine.close().await;
}

/// Test: Explicit close twice fires one callback
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idempotent_close() {
    let (engine, mut events) = start_engine(EngineConfig::default()).await;
    let mut stream = connect_ws(engine.local_addr()).await;
    let Event::Connect(id) = next_event(&mut events, 5).await else {
        panic!("expected connect");
    };

    let (first, second) = tokio::join!(engine.close_connection(id), engine.close_connection(id));
    assert!(first ^ second);

    assert_eq!(
        next_event(&mut events, 5).await,
        Event::Close(id, close_code::ABNORMAL_CLOSURE, Bytes::new())
    );
    expect_silence(&mut events, 200).await;
    assert!(wait_for_eof(&mut stream).await);

    engine.close().await;
}

/// Test: Peer hangup tears the connection down
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_hangup() {
    let (engine, mut events) = start_engine(EngineConfig::default()).await;
    let stream = connect_ws(engine.local_addr()).await;
    let Event::Connect(id) = next_event(&mut events, 5).await else {
        panic!("expected connect");
    };

    drop(stream);

    assert_eq!(
        next_event(&mut events, 5).await,
        Event::Close(id, close_code::ABNORMAL_CLOSURE, Bytes::new())
    );
    assert_eq!(engine.connection_count(), 0);

    engine.close().await;
}

/// Test: Idle connection is evicted by the sweep, active one survives
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_eviction() {
    let config = EngineConfig {
        connection_timeout_secs: 1,
        sweep_interval_ms: 200,
        ..Default::default()
    };
    let (engine, mut events) = start_engine_with(config, false).await;

    let mut idle = connect_ws(engine.local_addr()).await;
    let Event::Connect(idle_id) = next_event(&mut events, 5).await else {
        panic!("expected connect");
    };
    let mut active = connect_ws(engine.local_addr()).await;
    let Event::Connect(active_id) = next_event(&mut events, 5).await else {
        panic!("expected connect");
    };

    let pinger = tokio::spawn(async move {
        loop {
            if active
                .write_all(&client_frame(Opcode::Text, b"ping"))
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
    });

    let closed = loop {
        match next_event(&mut events, 6).await {
            Event::Close(id, code, reason) => break (id, code, reason),
            Event::Message(id, ..) => assert_eq!(id, active_id),
            other => panic!("unexpected callback: {other:?}"),
        }
    };
    assert_eq!(
        closed,
        (idle_id, close_code::ABNORMAL_CLOSURE, Bytes::new())
    );
    assert!(engine.connection(idle_id).is_none());
    assert!(wait_for_eof(&mut idle).await);
    assert!(engine.metrics().evictions.get() >= 1);

    // The active connection outlives several more sweeps
    let until = Instant::now() + Duration::from_millis(2500);
    while let Ok(Some(event)) = tokio::time::timeout_at(until, events.recv()).await {
        assert!(
            matches!(event, Event::Message(id, ..) if id == active_id),
            "unexpected callback: {event:?}"
        );
    }
    assert!(engine.connection(active_id).is_some_and(|conn| conn.is_open()));

    pinger.abort();
    engine.close().await;
}

/// Test: Shutdown closes every open connection once
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_close_closes_all() {
    let (engine, mut events) = start_engine(EngineConfig::default()).await;

    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(connect_ws(engine.local_addr()).await);
        assert!(matches!(next_event(&mut events, 5).await, Event::Connect(_)));
    }

    engine.close().await;

    for _ in 0..3 {
        assert!(matches!(next_event(&mut events, 5).await, Event::Close(..)));
    }
    expect_silence(&mut events, 200).await;
    assert_eq!(engine.connection_count(), 0);

    for stream in &mut streams {
        assert!(wait_for_eof(stream).await);
    }
}
