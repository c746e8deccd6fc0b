//! Integration Tests for the Call Multiplexing Protocol
//!
//! A mock server drives the far end of an in-process transport, so every
//! frame the client writes can be inspected.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::Instant;

use common::{accept_handshake, connected, connected_with, expect_message, spawn_echo, FAST_HELLO};
use switchboard_core::{
    connect, ClientConfig, InProcessConnector, MuxError, ReadyState, Signal, Transport,
    TransportEvent,
};

// =============================================================================
// Round Trips
// =============================================================================

#[tokio::test]
async fn test_two_calls_interleave_100_messages_each() {
    let (connection, server) = connected(FAST_HELLO).await;
    let (_echo, controls) = spawn_echo(server);

    let mut a = connection.call(&Signal::new());
    let mut b = connection.call(&Signal::new());
    for n in 0..100 {
        assert!(a.send(json!({"call": "a", "n": n})));
        assert!(b.send(json!({"call": "b", "n": n})));
    }

    for n in 0..100 {
        assert_eq!(a.recv().await, Some(Ok(json!({"call": "a", "n": n}))));
    }
    for n in 0..100 {
        assert_eq!(b.recv().await, Some(Ok(json!({"call": "b", "n": n}))));
    }

    // Two starts, then a switch before every data frame since the calls alternate
    assert_eq!(controls.load(Ordering::SeqCst), 202);
    assert_eq!(connection.active_calls(), 2);
}

#[tokio::test]
async fn test_consecutive_frames_share_one_switch() {
    let (connection, server) = connected(FAST_HELLO).await;
    let (_echo, controls) = spawn_echo(server);

    let mut call = connection.call(&Signal::new());
    for n in 0..10 {
        call.send(json!(n));
    }
    for n in 0..10 {
        assert_eq!(call.recv().await, Some(Ok(json!(n))));
    }

    // The start already selects the call
    assert_eq!(controls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_call_starts_are_rate_limited() {
    let hello = r#"{"ok":true,"l":{"c":{"b":1,"r":1},"p":{"b":100,"r":100}}}"#;
    let (connection, server) = connected(hello).await;
    let start = Instant::now();

    let _first = connection.call(&Signal::new());
    let _second = connection.call(&Signal::new());

    assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
    assert!(start.elapsed() < Duration::from_millis(10));

    assert_eq!(expect_message(&server).await, r#":{"c":2}"#);
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1010),
        "second start after {elapsed:?}"
    );

    let metrics = connection.call_limiter().metrics();
    assert_eq!(metrics.admitted, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_bypasses_packet_backpressure() {
    let hello = r#"{"ok":true,"l":{"c":{"b":10,"r":10},"p":{"b":1,"r":1}}}"#;
    let (connection, server) = connected(hello).await;
    let start = Instant::now();

    let a = connection.call(&Signal::new());
    let b = connection.call(&Signal::new());
    for n in 0..3 {
        a.send(json!(n));
    }

    assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
    assert_eq!(expect_message(&server).await, r#":{"c":2}"#);
    assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
    assert_eq!(expect_message(&server).await, "0");

    // The sender is now waiting a full second for the next packet token
    b.cancel();
    assert_eq!(expect_message(&server).await, r#":{"c":2,"stop":""}"#);
    assert!(start.elapsed() < Duration::from_millis(10));

    assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
    assert_eq!(expect_message(&server).await, "1");
    assert!(start.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_vanishing_packet_rate_stalls_without_closing() {
    let (connection, server) = connected(r#"{"ok":true,"l":{"p":{"b":1,"r":1e-30}}}"#).await;

    let call = connection.call(&Signal::new());
    call.send(json!(0));
    call.send(json!(1));

    assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
    assert_eq!(expect_message(&server).await, "0");
    assert!(tokio::time::timeout(Duration::from_secs(60), server.recv())
        .await
        .is_err());
    assert!(!connection.is_closed());

    // Stops still get through while the packet limiter is stalled
    call.cancel();
    assert_eq!(expect_message(&server).await, r#":{"c":1,"stop":""}"#);
}

#[tokio::test(start_paused = true)]
async fn test_defaults_apply_when_server_advertises_no_limits() {
    let config = ClientConfig::default()
        .with_call_limit(switchboard_core::RateLimitConfig::new(2.0, 0.5));
    let (connection, _server) = connected_with(r#"{"ok":true}"#, config).await;

    assert_eq!(connection.call_limiter().config().burst, 2.0);
    assert_eq!(connection.call_limiter().config().rate, 0.5);
    assert_eq!(connection.packet_limiter().config().burst, 50.0);
}

// =============================================================================
// Handshake Failures
// =============================================================================

#[tokio::test]
async fn test_refused_hello_fails_connect_and_closes_transport() {
    let (connector, mut acceptor) = InProcessConnector::new();
    let client = tokio::spawn(async move {
        connect(&connector, &Signal::new(), &ClientConfig::default()).await
    });

    let server = acceptor.accept().await.unwrap();
    accept_handshake(&server, r#"{"ok":false}"#).await;

    let result = client.await.unwrap();
    assert!(matches!(result, Err(MuxError::Handshake(_))));
    assert_eq!(server.recv().await, TransportEvent::Closed);
}

#[tokio::test]
async fn test_close_before_hello_fails_connect() {
    let (connector, mut acceptor) = InProcessConnector::new();
    let client = tokio::spawn(async move {
        connect(&connector, &Signal::new(), &ClientConfig::default()).await
    });

    let server = acceptor.accept().await.unwrap();
    assert_eq!(expect_message(&server).await, r#"{"p":"1"}"#);
    server.close().await;

    let result = client.await.unwrap();
    assert!(matches!(result, Err(MuxError::Handshake(msg)) if msg.contains("closed")));
}

#[tokio::test(start_paused = true)]
async fn test_silent_server_times_out() {
    let (connector, mut acceptor) = InProcessConnector::new();
    let config = ClientConfig::default().with_handshake_timeout(Duration::from_millis(500));
    let client = tokio::spawn(async move { connect(&connector, &Signal::new(), &config).await });

    let _server = acceptor.accept().await.unwrap();
    let result = client.await.unwrap();
    assert!(matches!(result, Err(MuxError::Handshake(msg)) if msg.contains("timed out")));
}

#[tokio::test]
async fn test_cancel_during_handshake_fails_with_reason() {
    let (connector, mut acceptor) = InProcessConnector::new();
    let signal = Signal::new();
    let client = tokio::spawn({
        let signal = signal.clone();
        async move { connect(&connector, &signal, &ClientConfig::default()).await }
    });

    let server = acceptor.accept().await.unwrap();
    assert_eq!(expect_message(&server).await, r#"{"p":"1"}"#);
    signal.cancel_with(MuxError::ConnectionClosed);

    let result = client.await.unwrap();
    assert!(matches!(result, Err(MuxError::ConnectionClosed)));
}

#[tokio::test]
async fn test_precancelled_signal_never_connects() {
    let (connector, _acceptor) = InProcessConnector::new();
    let signal = Signal::cancelled_with(MuxError::Cancelled);

    let result = connect(&connector, &signal, &ClientConfig::default()).await;
    assert!(matches!(result, Err(MuxError::Cancelled)));
}

#[tokio::test]
async fn test_connector_failure_is_reported() {
    let (connector, acceptor) = InProcessConnector::new();
    drop(acceptor);

    let result = connect(&connector, &Signal::new(), &ClientConfig::default()).await;
    assert!(matches!(result, Err(MuxError::Transport(_))));
}

// =============================================================================
// Termination
// =============================================================================

#[tokio::test]
async fn test_remote_stop_ends_only_that_call() {
    let (connection, server) = connected(FAST_HELLO).await;
    let mut a = connection.call(&Signal::new());
    let mut b = connection.call(&Signal::new());
    expect_message(&server).await;
    expect_message(&server).await;

    server.send(r#":{"c":2,"stop":"denied"}"#.into()).await.unwrap();
    server.send(r#":{"c":1}"#.into()).await.unwrap();
    server.send(r#""still here""#.into()).await.unwrap();

    assert_eq!(
        b.recv().await,
        Some(Err(MuxError::RemoteCall {
            reason: "denied".into()
        }))
    );
    assert_eq!(b.recv().await, None);
    assert_eq!(a.recv().await, Some(Ok(json!("still here"))));
    assert_eq!(connection.active_calls(), 1);

    // The peer ended it, so no stop frame goes back
    b.cancel();
    a.send(json!("ping"));
    assert_eq!(expect_message(&server).await, r#":{"c":1}"#);
    assert_eq!(expect_message(&server).await, "\"ping\"");
}

#[tokio::test]
async fn test_transport_error_ends_every_call() {
    let (connection, server) = connected(FAST_HELLO).await;
    let mut calls: Vec<_> = (0..5).map(|_| connection.call(&Signal::new())).collect();
    for _ in 0..5 {
        expect_message(&server).await;
    }

    server.fail("link down").await;

    for call in &mut calls {
        assert_eq!(call.recv().await, None);
        assert!(!call.send(json!("late")));
    }
    assert_eq!(
        connection.closed().await,
        MuxError::Transport("link down".into())
    );
    assert_eq!(connection.active_calls(), 0);
    assert_eq!(connection.transport_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_close_sends_no_stop_frames() {
    let (connection, server) = connected(FAST_HELLO).await;
    let _a = connection.call(&Signal::new());
    let _b = connection.call(&Signal::new());
    expect_message(&server).await;
    expect_message(&server).await;

    connection.close();
    assert_eq!(connection.closed().await, MuxError::ConnectionClosed);
    assert_eq!(server.recv().await, TransportEvent::Closed);
}

#[tokio::test]
async fn test_cancelling_caller_signal_cascades_to_its_calls_only() {
    let (connection, server) = connected(FAST_HELLO).await;
    let batch = Signal::new();
    let mut first = connection.call(&batch);
    let mut second = connection.call(&batch);
    let mut other = connection.call(&Signal::new());
    for _ in 0..3 {
        expect_message(&server).await;
    }

    batch.cancel();
    assert_eq!(first.recv().await, None);
    assert_eq!(second.recv().await, None);

    let mut stops = vec![expect_message(&server).await, expect_message(&server).await];
    stops.sort();
    assert_eq!(stops, vec![r#":{"c":1,"stop":""}"#, r#":{"c":2,"stop":""}"#]);

    server.send(r#":{"c":3}"#.into()).await.unwrap();
    server.send("42".into()).await.unwrap();
    assert_eq!(other.recv().await, Some(Ok(json!(42))));
}
