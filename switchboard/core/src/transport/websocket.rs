//! WebSocket Transport
//!
//! Client transport over `ws://` / `wss://` using `tokio-tungstenite`.
//! Only text messages carry protocol traffic; binary messages are treated as
//! a protocol violation and fail the transport. Ping/pong is answered by
//! tungstenite itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use super::in_process::InProcessTransport;
use super::traits::{Connector, ReadyState, Transport, TransportError, TransportEvent};

/// Client-side WebSocket transport
pub struct WebSocketTransport {
    inner: InProcessTransport,
    url: String,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`
    ///
    /// # Errors
    ///
    /// `TransportError::ConnectionFailed` if the upgrade handshake fails.
    pub async fn connect(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{url}: {e}")))?;

        let (local, remote) = InProcessTransport::new_pair();
        tokio::spawn(pump(stream, remote));
        tracing::info!(url = %url, "Connected to WebSocket");

        Ok(Self { inner: local, url })
    }

    /// The URL this transport connected to
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
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

async fn pump<S>(stream: tokio_tungstenite::WebSocketStream<S>, remote: InProcessTransport)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let remote = &remote;

    let reader = async move {
        loop {
            let next = tokio::select! {
                () = remote.closed() => return,
                next = source.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    if remote.send(text).await.is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!("Binary WebSocket message, closing");
                    remote.fail("unexpected binary message").await;
                    return;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("WebSocket closed by peer");
                    remote.close().await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "WebSocket read error");
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
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::warn!(error = %e, "WebSocket write error");
                        remote.fail(e.to_string()).await;
                        return;
                    }
                }
                TransportEvent::Closed | TransportEvent::Error(_) => break,
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    };

    tokio::join!(reader, writer);
    tracing::info!("Disconnected from WebSocket");
}

/// Connector opening a fresh WebSocket per attempt
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Connector for `url`
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Bound each connect attempt
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let transport =
            tokio::time::timeout(self.connect_timeout, WebSocketTransport::connect(&self.url))
                .await
                .map_err(|_| TransportError::Timeout)??;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = WebSocketTransport::connect(format!("ws://{addr}")).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_text_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(format!("echo:{text}"))).await.unwrap();
            }
        });

        let transport = WebSocketConnector::new(format!("ws://{addr}"))
            .connect()
            .await
            .unwrap();
        transport.send("hi".into()).await.unwrap();
        assert_eq!(
            transport.recv().await,
            TransportEvent::Message("echo:hi".into())
        );

        transport.close().await;
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }
}
