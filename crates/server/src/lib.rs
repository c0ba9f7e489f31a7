//! Volant server core: outbox relay, channel router, call-signal gateway,
//! and the WebSocket session acceptor.
//!
//! The business layer (profile/friend/group CRUD) lives elsewhere; it
//! writes domain events through `volant_storage::Storage::publish_event`
//! inside its own transactions and may poke the relay's wake handle. This
//! crate owns everything from the committed outbox row to the connected
//! client.

pub mod alert;
pub mod auth;
pub mod config;
pub mod metrics;
pub mod relay;
pub mod router;
pub mod session;
pub mod signal;
pub mod util;
