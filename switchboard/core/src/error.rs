//! Error Types
//!
//! A single cloneable error enum flows through the whole crate. It doubles as
//! the reason carried by a cancelled [`Signal`](crate::signal::Signal), so it
//! must be `Clone`: many observers read the same reason.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the multiplexing runtime
#[derive(Clone, Debug, Error, PartialEq)]
pub enum MuxError {
    /// Plain cancellation with no further cause
    #[error("cancelled")]
    Cancelled,

    /// The handshake failed (bad hello, early close, timeout)
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The remote side terminated a call with a `stop` control frame
    #[error("remote call error: {reason}")]
    RemoteCall {
        /// Reason string sent by the remote side
        reason: String,
    },

    /// The transport closed underneath the connection
    #[error("transport closed")]
    TransportClosed,

    /// The transport reported an error
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection is gone; no further calls can be made on it
    #[error("connection closed")]
    ConnectionClosed,

    /// A limiter or backoff was built with unusable parameters
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Client configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),

    /// `close()` was called on an already closed channel
    #[error("channel already closed")]
    ChannelClosed,

    /// `select` was called with nothing to wait on
    #[error("select called with no channels and no cancellation signal")]
    EmptySelect,

    /// A supervised task or halt hook returned an error
    #[error("task failed: {0}")]
    Task(String),

    /// A supervised task panicked
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// A session runner exited while calls were still attached to it
    #[error("session runner stopped")]
    RunnerStopped,
}

impl MuxError {
    /// Whether this reason is plain cancellation rather than a failure
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Build a task error from anything displayable (typically `anyhow::Error`)
    pub fn task(err: impl std::fmt::Display) -> Self {
        Self::Task(format!("{err:#}"))
    }

    /// Build a panic error from a `catch_unwind` payload
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::TaskPanicked(msg)
    }
}

impl From<TransportError> for MuxError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionClosed => Self::TransportClosed,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for MuxError {
    fn from(err: anyhow::Error) -> Self {
        Self::task(err)
    }
}

/// Convenience alias used across the crate
pub type Result<T, E = MuxError> = std::result::Result<T, E>;
