//! Switchboard Core - Many Logical Calls over One Connection
//!
//! This crate multiplexes any number of concurrent remote calls over a single
//! text transport, with cancellation, supervision and rate limiting built in.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Application                              │
//! │        Call::send / Call::recv          MuxCall (server side)    │
//! └───────────────┬─────────────────────────────────┬────────────────┘
//!                 │                                 │
//! ┌───────────────┴────────────────┐  ┌─────────────┴────────────────┐
//! │ Connection (protocol)          │  │ Multiplexer (mux)            │
//! │  handshake, call table         │  │  single lazy runner,         │
//! │  inbound demux / outbound mux  │  │  pending tasks, restart      │
//! └───────┬──────────────┬─────────┘  └─────────────┬────────────────┘
//!         │              │                          │
//! ┌───────┴──────┐ ┌─────┴──────────┐ ┌─────────────┴────────────────┐
//! │ RateLimiter  │ │ BroadcastQueue │ │ Channel / select             │
//! │ Backoff      │ │                │ │ SupervisionGroup / Signal    │
//! └──────────────┘ └────────────────┘ └──────────────────────────────┘
//!         │
//! ┌───────┴──────────────────────────────────────────────────────────┐
//! │ Transport: InProcess | UnixSocket | WebSocket (feature)          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Signal`]: cancellation token carrying a reason
//! - [`SupervisionGroup`]: many member signals folded into one lifetime
//! - [`Channel`]: unbounded FIFO with fair wakeups, plus [`select`]
//! - [`BroadcastQueue`]: every listener sees every item
//! - [`RateLimiter`] / [`Backoff`]: admission control and retry delays
//! - [`Connection`] / [`Call`]: the client side of the call protocol
//! - [`Multiplexer`]: one runner task serving many calls
//! - [`ReconnectingClient`]: keeps a connection alive
//!
//! # Quick Start
//!
//! ```ignore
//! use switchboard_core::{connect, ClientConfig, Signal, UnixSocketConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     switchboard_core::logging::init_tracing("switchboard_core=info")?;
//!
//!     let config = ClientConfig::load()?;
//!     let connector = UnixSocketConnector::with_default_path();
//!     let signal = Signal::new();
//!     let connection = connect(&connector, &signal, &config).await?;
//!
//!     let mut call = connection.call(&Signal::new());
//!     call.send(serde_json::json!({"method": "ping"}));
//!     while let Some(item) = call.recv().await {
//!         tracing::info!(reply = %item?, "Reply");
//!     }
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod error;
pub mod group;
pub mod limit;
pub mod logging;
pub mod mux;
pub mod protocol;
pub mod queue;
pub mod reconnect;
pub mod signal;
pub mod transport;

pub use channel::{channel_for_cancellation, select, Channel, Consumed, Selected};
pub use config::{default_config_path, ClientConfig, ConfigError};
pub use error::{MuxError, Result};
pub use group::SupervisionGroup;
pub use limit::{
    Backoff, BackoffConfig, LimiterMetrics, RateLimitConfig, RateLimitResult, RateLimiter,
};
pub use mux::{CallToken, MuxCall, MuxSession, MuxTask, Multiplexer};
pub use protocol::{connect, Call, CallId, CallSender, CallStream, Connection, Hello};
pub use queue::{BroadcastQueue, QueueListener};
pub use reconnect::{ConnectionState, ReconnectingClient};
pub use signal::Signal;
pub use transport::{
    create_connector, Connector, InProcessAcceptor, InProcessConnector, InProcessTransport,
    ReadyState, Transport, TransportConfig, TransportError, TransportEvent, TransportType,
};

#[cfg(unix)]
pub use transport::{UnixSocketConnector, UnixSocketTransport};
#[cfg(feature = "websocket")]
pub use transport::{WebSocketConnector, WebSocketTransport};
