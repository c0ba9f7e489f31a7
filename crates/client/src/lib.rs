//! Client side of the Volant realtime core.
//!
//! [`ConnectionManager`] owns one resilient connection per logical channel
//! (messaging, presence, signaling): it performs the authenticated
//! handshake with a freshly fetched credential on every attempt, reconnects
//! on a bounded backoff schedule, and runs the per-channel heartbeat where
//! the channel requires one. Incoming domain events flow through the
//! [`EventDispatcher`]; signaling frames feed the [`call::CallService`],
//! which drives an external [`MediaEngine`] through call negotiation.

pub mod backoff;
pub mod call;
pub mod credential;
pub mod dispatch;
pub mod heartbeat;
pub mod manager;
pub mod media;
pub mod transport;
pub mod ws;

pub use backoff::ReconnectSchedule;
pub use credential::{CredentialProvider, StaticCredentialProvider};
pub use dispatch::{DispatchResult, EventDispatcher, HandlerError};
pub use manager::{ClientConfig, ClientError, ConnectionManager, LinkState};
pub use media::{MediaEngine, MediaError, MediaEvent};
pub use transport::{FrameLink, Transport, TransportError};
