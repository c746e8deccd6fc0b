//! Transport Configuration
//!
//! Which endpoint a client dials and how long a dial may take. Appears as the
//! `[transport]` table of the client configuration file:
//!
//! ```toml
//! [transport]
//! connect_timeout_ms = 2000
//!
//! [transport.transport]
//! kind = "unix_socket"
//! path = "/run/user/1000/switchboard/switchboard.sock"
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Endpoint kind, tagged by `kind` in TOML
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportType {
    /// Channel pair inside this process
    ///
    /// The peer must be handed over in code (`InProcessConnector::new()`), so
    /// this cannot be dialled from configuration.
    #[default]
    InProcess,

    /// Unix domain socket
    #[cfg(unix)]
    UnixSocket {
        /// Socket to dial; `None` means [`default_socket_path`](super::unix_socket::default_socket_path)
        #[serde(default)]
        path: Option<PathBuf>,
    },

    /// WebSocket endpoint (`ws://` or `wss://`)
    #[cfg(feature = "websocket")]
    WebSocket {
        /// Endpoint URL
        url: String,
    },
}

impl TransportType {
    /// Resolve a `SWITCHBOARD_TRANSPORT` value
    ///
    /// Accepts `inprocess`/`embedded`, `unix`/`socket` (path from
    /// `SWITCHBOARD_SOCKET`) and, with the `websocket` feature, `ws`/`websocket`
    /// (URL from `SWITCHBOARD_WS_URL`). Returns `None` for anything else.
    #[must_use]
    pub fn from_env_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "inprocess" | "embedded" => Some(Self::InProcess),
            #[cfg(unix)]
            "unix" | "socket" => Some(Self::UnixSocket {
                path: std::env::var_os("SWITCHBOARD_SOCKET").map(PathBuf::from),
            }),
            #[cfg(feature = "websocket")]
            "ws" | "websocket" => Some(Self::WebSocket {
                url: std::env::var("SWITCHBOARD_WS_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:8765".into()),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess => f.write_str("in-process"),
            #[cfg(unix)]
            Self::UnixSocket { path: Some(path) } => write!(f, "unix:{}", path.display()),
            #[cfg(unix)]
            Self::UnixSocket { path: None } => f.write_str("unix:<default>"),
            #[cfg(feature = "websocket")]
            Self::WebSocket { url } => f.write_str(url),
        }
    }
}

/// Endpoint plus dial timeout
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoint to dial
    pub transport: TransportType,

    /// Bound on a single dial, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transport: TransportType::default(),
            connect_timeout_ms: 5000,
        }
    }
}

impl TransportConfig {
    /// In-process endpoint
    #[must_use]
    pub fn embedded() -> Self {
        Self::default()
    }

    /// Unix socket endpoint (`None` = default path)
    #[cfg(unix)]
    #[must_use]
    pub fn unix_socket(path: Option<PathBuf>) -> Self {
        Self {
            transport: TransportType::UnixSocket { path },
            ..Self::default()
        }
    }

    /// WebSocket endpoint
    #[cfg(feature = "websocket")]
    #[must_use]
    pub fn websocket(url: impl Into<String>) -> Self {
        Self {
            transport: TransportType::WebSocket { url: url.into() },
            ..Self::default()
        }
    }

    /// Set the dial timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Dial timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
