//! WebSocket transport: Volant frames as binary messages.

use crate::transport::{FrameLink, Transport, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use volant_proto::Frame;

pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        WsTransport { connect_timeout }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        WsTransport::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameLink>, TransportError> {
        debug!(url, "connecting websocket");
        let (stream, _) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|error| TransportError::Network(error.to_string()))?;
        Ok(Box::new(WsFrameLink { stream }))
    }
}

pub struct WsFrameLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameLink for WsFrameLink {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let encoded = frame
            .encode()
            .map_err(|error| TransportError::Codec(error.to_string()))?;
        self.stream
            .send(Message::Binary(encoded))
            .await
            .map_err(|error| TransportError::Network(error.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let (frame, _) = Frame::decode(&data)
                        .map_err(|error| TransportError::Codec(error.to_string()))?;
                    return Ok(Some(frame));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(error)) => return Err(TransportError::Network(error.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
