use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message,
};
use tracing::trace;

/// Errors surfaced by the raw transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport receive failed: {0}")]
    Recv(String),
    #[error("transport is closed")]
    Closed,
}

/// One open bidirectional text-frame connection.
pub trait Connection: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text frame. `None` means the peer closed the connection.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Factory for connections; mocked in engine tests.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// Production WebSocket transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(other) => {
                    // Binary and ping/pong control frames are not part of
                    // the protocol; the library answers pings on its own.
                    trace!(kind = ?other, "ignoring non-text frame");
                }
                Err(err) => return Some(Err(TransportError::Recv(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

impl Transport for WsTransport {
    type Conn = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, TransportError> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(WsConnection { inner: stream })
    }
}
