//! Transport Factory
//!
//! Builds a [`Connector`] from configuration, so reconnecting clients can be
//! set up without naming a concrete transport type.

use std::sync::Arc;

use super::config::{TransportConfig, TransportType};
use super::traits::{Connector, TransportError};

#[cfg(unix)]
use super::unix_socket::UnixSocketConnector;

/// Create a connector based on configuration
///
/// # Errors
///
/// `TransportError::InvalidState` for `InProcess`, which needs a live peer
/// (use `InProcessConnector::new()` directly).
pub fn create_connector(config: &TransportConfig) -> Result<Arc<dyn Connector>, TransportError> {
    tracing::debug!(transport = %config.transport, timeout = ?config.connect_timeout(), "Creating connector");
    match &config.transport {
        TransportType::InProcess => Err(TransportError::InvalidState(
            "InProcess transport requires a peer; use InProcessConnector::new() directly".into(),
        )),

        #[cfg(unix)]
        TransportType::UnixSocket { path } => {
            let connector = match path {
                Some(socket_path) => UnixSocketConnector::new(socket_path.clone()),
                None => UnixSocketConnector::with_default_path(),
            };
            Ok(Arc::new(
                connector.with_connect_timeout(config.connect_timeout()),
            ))
        }

        #[cfg(feature = "websocket")]
        TransportType::WebSocket { url } => Ok(Arc::new(
            super::websocket::WebSocketConnector::new(url.clone())
                .with_connect_timeout(config.connect_timeout()),
        )),
    }
}
