//! In-Process Transport
//!
//! Direct channel-based transport for embedding both ends in one process.
//! Also serves as the local half of the socket transports, whose I/O tasks
//! drive the other half.
//!
//! # Usage
//!
//! ```ignore
//! let (client, server) = InProcessTransport::new_pair();
//!
//! // Hand `client` to `protocol::connect`, drive `server` from a test peer
//! server.send(r#"{"ok":true,"i":null}"#.into()).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{Connector, ReadyState, Transport, TransportError, TransportEvent};

/// Default per-direction buffer, in messages
pub const DEFAULT_CAPACITY: usize = 256;

/// One end of an in-memory transport pair
pub struct InProcessTransport {
    /// Events towards the peer; dropped on close so the peer sees `Closed`
    outgoing: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<TransportEvent>>,
    local_closed: CancellationToken,
    peer_closed: CancellationToken,
}

impl InProcessTransport {
    /// Create a connected pair
    #[must_use]
    pub fn new_pair() -> (Self, Self) {
        Self::new_pair_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a connected pair with a custom per-direction buffer
    #[must_use]
    pub fn new_pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
        let a_closed = CancellationToken::new();
        let b_closed = CancellationToken::new();

        let a = Self {
            outgoing: Mutex::new(Some(a_tx)),
            incoming: tokio::sync::Mutex::new(b_rx),
            local_closed: a_closed.clone(),
            peer_closed: b_closed.clone(),
        };
        let b = Self {
            outgoing: Mutex::new(Some(b_tx)),
            incoming: tokio::sync::Mutex::new(a_rx),
            local_closed: b_closed,
            peer_closed: a_closed,
        };
        (a, b)
    }

    /// Deliver a transport error to the peer, then close
    ///
    /// The peer's `recv` yields `Error(reason)` after any messages already sent.
    pub async fn fail(&self, reason: impl Into<String>) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(TransportEvent::Error(reason.into())).await;
        }
        self.shutdown();
    }

    /// Resolve once either end has closed
    pub async fn closed(&self) {
        tokio::select! {
            () = self.local_closed.cancelled() => {}
            () = self.peer_closed.cancelled() => {}
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        if self.local_closed.is_cancelled() || self.peer_closed.is_cancelled() {
            return None;
        }
        self.outgoing.lock().clone()
    }

    fn shutdown(&self) {
        self.outgoing.lock().take();
        self.local_closed.cancel();
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        let tx = self.sender().ok_or(TransportError::ConnectionClosed)?;
        tokio::select! {
            biased;
            () = self.local_closed.cancelled() => Err(TransportError::ConnectionClosed),
            result = tx.send(TransportEvent::Message(text)) => {
                result.map_err(|_| TransportError::ConnectionClosed)
            }
        }
    }

    async fn recv(&self) -> TransportEvent {
        if self.local_closed.is_cancelled() {
            return TransportEvent::Closed;
        }
        let mut rx = self.incoming.lock().await;
        let event = tokio::select! {
            biased;
            () = self.local_closed.cancelled() => return TransportEvent::Closed,
            event = rx.recv() => event,
        };
        match event {
            Some(TransportEvent::Message(text)) => TransportEvent::Message(text),
            Some(TransportEvent::Error(reason)) => {
                self.shutdown();
                TransportEvent::Error(reason)
            }
            Some(TransportEvent::Closed) | None => {
                self.shutdown();
                TransportEvent::Closed
            }
        }
    }

    async fn close(&self) {
        self.shutdown();
    }

    fn state(&self) -> ReadyState {
        if self.local_closed.is_cancelled() {
            ReadyState::Closed
        } else if self.peer_closed.is_cancelled() {
            ReadyState::Closing
        } else {
            ReadyState::Open
        }
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        self.local_closed.cancel();
    }
}

impl std::fmt::Debug for InProcessTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessTransport")
            .field("state", &self.state())
            .finish()
    }
}

/// Connector handing out in-process transports
///
/// Every `connect` creates a fresh pair and passes the far end to the
/// matching [`InProcessAcceptor`].
#[derive(Clone, Debug)]
pub struct InProcessConnector {
    accept_tx: mpsc::UnboundedSender<InProcessTransport>,
    capacity: usize,
}

/// Receives the far ends of connections made through an [`InProcessConnector`]
#[derive(Debug)]
pub struct InProcessAcceptor {
    accept_rx: mpsc::UnboundedReceiver<InProcessTransport>,
}

impl InProcessConnector {
    /// Create a connector and its acceptor
    #[must_use]
    pub fn new() -> (Self, InProcessAcceptor) {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a connector whose pairs use a custom buffer
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, InProcessAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                capacity,
            },
            InProcessAcceptor { accept_rx },
        )
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let (local, remote) = InProcessTransport::new_pair_with_capacity(self.capacity);
        self.accept_tx.send(remote).map_err(|_| {
            TransportError::ConnectionFailed("in-process acceptor dropped".to_string())
        })?;
        Ok(Arc::new(local))
    }
}

impl InProcessAcceptor {
    /// Wait for the next incoming connection
    ///
    /// Returns `None` once every connector has been dropped.
    pub async fn accept(&mut self) -> Option<InProcessTransport> {
        self.accept_rx.recv().await
    }
}
