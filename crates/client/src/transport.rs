//! Transport seam between the connection manager and the wire.
//!
//! A [`Transport`] dials; a [`FrameLink`] is one live duplex link speaking
//! Volant frames. The WebSocket implementation lives in [`crate::ws`];
//! tests substitute scripted links.

use async_trait::async_trait;
use thiserror::Error;
use volant_proto::Frame;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("frame codec failure: {0}")]
    Codec(String),

    #[error("link closed")]
    Closed,
}

#[async_trait]
pub trait FrameLink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// The next inbound frame; `Ok(None)` is a clean peer close.
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameLink>, TransportError>;
}
