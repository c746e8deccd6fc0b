//! Reconnecting Client
//!
//! Keeps one live [`Connection`] for a [`Connector`]. A failed attempt waits
//! out the [`Backoff`] delay before the next one; a lost connection is
//! replaced right away. Progress is published on a `watch` channel.
//!
//! ```text
//!   Connecting ──ok──► Connected ──closed──► Connecting
//!       │                                        ▲
//!       └──err──► Backoff { delay } ─────────────┘
//!                     │ attempt cap reached / signal cancelled
//!                     ▼
//!                  Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::MuxError;
use crate::limit::Backoff;
use crate::protocol::{connect, Connection};
use crate::signal::Signal;
use crate::transport::{create_connector, Connector};

/// Where the reconnect loop currently is
#[derive(Clone, Debug)]
pub enum ConnectionState {
    /// An attempt is in flight (1-based, counting consecutive failures)
    Connecting {
        /// Attempt number
        attempt: u32,
    },
    /// A connection is up
    Connected(Connection),
    /// Waiting before the next attempt
    Backoff {
        /// Failed attempts so far
        attempt: u32,
        /// Delay before the next attempt
        delay: Duration,
    },
    /// The loop ended; no further attempts are made
    Stopped(MuxError),
}

/// Background task maintaining a connection
///
/// Dropping the client stops the loop and closes its connection.
pub struct ReconnectingClient {
    state: watch::Receiver<ConnectionState>,
    signal: Signal,
}

impl ReconnectingClient {
    /// Start reconnecting through `connector`, bounded by `signal`
    ///
    /// # Errors
    ///
    /// [`MuxError::InvalidConfig`] if the reconnect backoff is unusable.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        config: ClientConfig,
        signal: &Signal,
    ) -> Result<Self, MuxError> {
        let backoff = Backoff::new(config.reconnect)?;
        let signal = signal.child();
        let (tx, state) = watch::channel(ConnectionState::Connecting { attempt: 1 });

        tokio::spawn(run(connector, config, backoff, signal.clone(), tx));
        Ok(Self { state, signal })
    }

    /// Start reconnecting with the transport named in `config`
    ///
    /// # Errors
    ///
    /// Fails if no connector can be built for the configured transport, or
    /// the reconnect backoff is unusable.
    pub fn from_config(config: ClientConfig, signal: &Signal) -> Result<Self, MuxError> {
        let connector = create_connector(&config.transport)?;
        Self::spawn(connector, config, signal)
    }

    /// Wait for a live connection
    ///
    /// # Errors
    ///
    /// The reason the loop stopped, once it has.
    pub async fn connection(&self) -> Result<Connection, MuxError> {
        let mut state = self.state.clone();
        loop {
            {
                let current = state.borrow_and_update();
                match &*current {
                    ConnectionState::Connected(conn) if !conn.is_closed() => {
                        return Ok(conn.clone());
                    }
                    ConnectionState::Stopped(reason) => return Err(reason.clone()),
                    _ => {}
                }
            }
            if state.changed().await.is_err() {
                return Err(MuxError::ConnectionClosed);
            }
        }
    }

    /// The live connection, if there is one right now
    #[must_use]
    pub fn current(&self) -> Option<Connection> {
        match &*self.state.borrow() {
            ConnectionState::Connected(conn) if !conn.is_closed() => Some(conn.clone()),
            _ => None,
        }
    }

    /// Subscribe to state changes
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop reconnecting and close the current connection
    pub fn close(&self) {
        self.signal.cancel_with(MuxError::ConnectionClosed);
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.signal.cancel_with(MuxError::ConnectionClosed);
    }
}

impl std::fmt::Debug for ReconnectingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingClient")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

async fn run(
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    mut backoff: Backoff,
    signal: Signal,
    tx: watch::Sender<ConnectionState>,
) {
    let mut failures: u32 = 0;

    while !signal.is_cancelled() {
        tx.send_replace(ConnectionState::Connecting {
            attempt: failures + 1,
        });

        match connect(connector.as_ref(), &signal, &config).await {
            Ok(conn) => {
                backoff.success();
                failures = 0;
                tx.send_replace(ConnectionState::Connected(conn.clone()));

                let reason = conn.closed().await;
                if signal.is_cancelled() {
                    break;
                }
                info!(reason = %reason, "Connection lost, reconnecting");
            }
            Err(e) => {
                if signal.is_cancelled() {
                    break;
                }
                failures += 1;
                warn!(attempt = failures, error = %e, "Connection attempt failed");

                if config
                    .max_reconnect_attempts
                    .is_some_and(|max| failures >= max)
                {
                    warn!(attempts = failures, "Giving up reconnecting");
                    tx.send_replace(ConnectionState::Stopped(e));
                    return;
                }

                let delay = backoff.error();
                debug!(attempt = failures, delay = ?delay, "Backing off");
                tx.send_replace(ConnectionState::Backoff {
                    attempt: failures,
                    delay,
                });
                if !backoff.timeout(&signal).await {
                    break;
                }
            }
        }
    }

    let reason = signal.reason().unwrap_or(MuxError::Cancelled);
    debug!(reason = %reason, "Reconnect loop stopped");
    tx.send_replace(ConnectionState::Stopped(reason));
}
