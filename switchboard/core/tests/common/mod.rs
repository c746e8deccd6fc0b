//! Shared mock-server helpers for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchboard_core::protocol::wire::{ControlFrame, Frame};
use switchboard_core::{
    connect, ClientConfig, Connection, InProcessConnector, InProcessTransport, Signal, Transport,
    TransportEvent,
};
use tokio::task::JoinHandle;

/// Hello with limits high enough to never throttle a test
pub const FAST_HELLO: &str =
    r#"{"ok":true,"i":{"server":"mock"},"l":{"c":{"b":100,"r":100},"p":{"b":1000,"r":1000}}}"#;

/// Next message from `transport`, failing the test on close, error or a 10s wait
pub async fn expect_message(transport: &dyn Transport) -> String {
    match tokio::time::timeout(Duration::from_secs(10), transport.recv()).await {
        Ok(TransportEvent::Message(text)) => text,
        other => panic!("expected a message, got {other:?}"),
    }
}

/// Server half of the handshake
pub async fn accept_handshake(transport: &dyn Transport, hello: &str) {
    assert_eq!(expect_message(transport).await, r#"{"p":"1"}"#);
    transport.send(hello.to_string()).await.unwrap();
}

/// Connect a client over an in-process pair and return it with the server end
pub async fn connected(hello: &str) -> (Connection, InProcessTransport) {
    connected_with(hello, ClientConfig::default()).await
}

/// Like [`connected`] with a custom client configuration
pub async fn connected_with(hello: &str, config: ClientConfig) -> (Connection, InProcessTransport) {
    let (connector, mut acceptor) = InProcessConnector::new();
    let client = tokio::spawn(async move {
        let signal = Signal::new();
        connect(&connector, &signal, &config).await
    });

    let server = acceptor.accept().await.unwrap();
    accept_handshake(&server, hello).await;
    let connection = client.await.unwrap().unwrap();
    (connection, server)
}

/// Echo every data frame back to the call it arrived for
///
/// Returns the task and a counter of control frames received.
pub fn spawn_echo<T: Transport + 'static>(server: T) -> (JoinHandle<()>, Arc<AtomicUsize>) {
    let controls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&controls);

    let task = tokio::spawn(async move {
        let mut current = None;
        while let TransportEvent::Message(text) = server.recv().await {
            match Frame::decode(&text).unwrap() {
                Frame::Control(frame) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if frame.stop.is_none() {
                        current = frame.c;
                    }
                }
                Frame::Data(value) => {
                    let id = current.expect("data before any call switch");
                    server.send(ControlFrame::switch(id).encode()).await.unwrap();
                    server.send(value.to_string()).await.unwrap();
                }
            }
        }
    });

    (task, controls)
}
