//! Transport Layer
//!
//! The protocol runs over any [`Transport`]: a text message pipe that can be
//! sent to, received from and closed. Implementations:
//! - `InProcess`: tokio channels, both ends in one process
//! - `UnixSocket`: local IPC, length-prefixed CRC32 frames
//! - `WebSocket`: remote IPC over `ws://`/`wss://` (feature `websocket`)
//!
//! A [`Connector`] opens a fresh transport per connection attempt, which is
//! what the reconnecting client needs.

pub mod config;
pub mod factory;
pub mod frame;
pub mod in_process;
pub mod traits;
#[cfg(unix)]
pub mod unix_socket;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use config::{TransportConfig, TransportType};
pub use factory::create_connector;
pub use frame::FrameDecoder;
pub use in_process::{InProcessAcceptor, InProcessConnector, InProcessTransport};
pub use traits::{Connector, ReadyState, Transport, TransportError, TransportEvent};

#[cfg(unix)]
pub use unix_socket::{UnixSocketConnector, UnixSocketTransport};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
