//! Unix Socket Client Transport
//!
//! Connects to a socket path and bridges it to an in-process transport half.
//! A pump task owns the socket: it decodes inbound frames into messages and
//! encodes outbound messages into frames.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::transport::frame::{encode, FrameDecoder};
use crate::transport::in_process::InProcessTransport;
use crate::transport::traits::{
    Connector, ReadyState, Transport, TransportError, TransportEvent,
};

/// Client-side Unix socket transport
pub struct UnixSocketTransport {
    inner: InProcessTransport,
    socket_path: PathBuf,
}

impl UnixSocketTransport {
    /// Connect to the socket at `socket_path`
    ///
    /// # Errors
    ///
    /// `TransportError::ConnectionFailed` if nothing is listening there.
    pub async fn connect(socket_path: impl Into<PathBuf>) -> Result<Self, TransportError> {
        let socket_path = socket_path.into();
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "failed to connect to {}: {e}",
                socket_path.display()
            ))
        })?;
        Ok(Self::from_stream(stream, socket_path))
    }

    /// Wrap an already connected stream
    #[must_use]
    pub fn from_stream(stream: UnixStream, socket_path: PathBuf) -> Self {
        let (local, remote) = InProcessTransport::new_pair();
        tokio::spawn(pump(stream, remote));
        tracing::info!(path = %socket_path.display(), "Connected to socket");
        Self {
            inner: local,
            socket_path,
        }
    }

    /// The socket path this transport connected to
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        self.inner.send(text).await
    }

    async fn recv(&self) -> TransportEvent {
        self.inner.recv().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    fn state(&self) -> ReadyState {
        self.inner.state()
    }
}

/// Move bytes between the socket and the far in-process half until either closes
async fn pump(stream: UnixStream, remote: InProcessTransport) {
    let (mut read_half, mut write_half) = stream.into_split();
    let remote = &remote;

    let reader = async move {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = tokio::select! {
                () = remote.closed() => return,
                read = read_half.read(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    tracing::debug!("Socket closed by peer");
                    remote.close().await;
                    return;
                }
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    loop {
                        match decoder.decode() {
                            Ok(Some(text)) => {
                                if remote.send(text).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                tracing::warn!(error = %e, "Frame decode error");
                                remote.fail(e.to_string()).await;
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Socket read error");
                    remote.fail(e.to_string()).await;
                    return;
                }
            }
        }
    };

    let writer = async move {
        loop {
            match remote.recv().await {
                TransportEvent::Message(text) => {
                    let frame = match encode(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping unencodable message");
                            continue;
                        }
                    };
                    if let Err(e) = write_half.write_all(&frame).await {
                        tracing::warn!(error = %e, "Socket write error");
                        remote.fail(e.to_string()).await;
                        break;
                    }
                }
                TransportEvent::Closed | TransportEvent::Error(_) => break,
            }
        }
        let _ = write_half.shutdown().await;
    };

    tokio::join!(reader, writer);
    tracing::info!("Disconnected from socket");
}

/// Connector opening a fresh socket connection per attempt
#[derive(Clone, Debug)]
pub struct UnixSocketConnector {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl UnixSocketConnector {
    /// Connector for `socket_path`
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Connector for the default socket path
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(super::default_socket_path())
    }

    /// Bound each connect attempt
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The socket path
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

#[async_trait]
impl Connector for UnixSocketConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = tokio::time::timeout(
            self.connect_timeout,
            UnixSocketTransport::connect(self.socket_path.clone()),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        Ok(Arc::new(transport))
    }
}
