//! Transport Traits
//!
//! The protocol layer only needs a text pipe: send a string, receive the next
//! event, close. Everything else (framing, sockets, handshakes of the
//! underlying medium) stays inside the implementations.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by transport implementations
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransportError {
    /// The connection could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport is closed
    #[error("connection closed")]
    ConnectionClosed,

    /// Writing to the transport failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A wire frame was malformed or too large
    #[error("frame error: {0}")]
    Frame(String),

    /// A wire frame failed its integrity check
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// The operation did not complete in time
    #[error("timed out")]
    Timeout,
}

/// Lifecycle of a transport, mirroring the usual socket ready states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadyState {
    /// Still being established
    Connecting,
    /// Usable for sending and receiving
    Open,
    /// Close requested, buffered frames may still flush
    Closing,
    /// Gone for good
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something that happened on the receive side
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// One complete text message
    Message(String),
    /// The transport closed (either side)
    Closed,
    /// The transport failed; no further messages follow
    Error(String),
}

/// Bidirectional text message pipe
///
/// `recv` is only ever driven by a single reader at a time; `send` may be
/// called concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text message
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Wait for the next receive-side event
    ///
    /// After `Closed` or `Error` every further call returns `Closed`.
    async fn recv(&self) -> TransportEvent;

    /// Close the transport. Idempotent.
    async fn close(&self);

    /// Current lifecycle state
    fn state(&self) -> ReadyState;
}

/// Opens fresh transports, one per connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new transport
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        (**self).connect().await
    }
}
