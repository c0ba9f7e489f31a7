//! Control messages exchanged before a channel is considered live.
//!
//! The client opens the socket, sends [`Hello`] with a bearer token fetched
//! from its credential provider, and waits for [`Welcome`] or
//! [`HandshakeReject`]. Tokens are validated by the server on every
//! handshake; nothing about a prior session is trusted across reconnects.

use crate::{impl_control_codec, ChannelKind, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
    pub channel: ChannelKind,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u16,
    /// Highest per-scope sequence the client has already applied, if it
    /// intends to backfill immediately after the handshake.
    #[serde(default)]
    pub resume_after: Option<u64>,
}

fn default_protocol_version() -> u16 {
    PROTOCOL_VERSION
}

impl Hello {
    pub fn new(token: impl Into<String>, channel: ChannelKind) -> Self {
        Hello {
            token: token.into(),
            channel,
            protocol_version: PROTOCOL_VERSION,
            resume_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub session_id: String,
    pub principal_id: String,
    pub channel: ChannelKind,
    /// Interval the server expects pings at on heartbeat channels.
    pub heartbeat_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    InvalidToken,
    UnsupportedChannel,
    UnsupportedVersion,
    Malformed,
}

impl RejectCode {
    /// A credential rejection must not be retried with the same token; the
    /// client fetches a fresh one before the next attempt.
    pub fn is_credential(self) -> bool {
        matches!(self, Self::InvalidToken)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReject {
    pub code: RejectCode,
    pub message: String,
}

/// Generic error notice for a live channel. Handler-level problems stay on
/// the server; this is only for conditions the peer can act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub code: String,
    pub message: String,
}

impl_control_codec!(Hello);
impl_control_codec!(Welcome);
impl_control_codec!(HandshakeReject);
impl_control_codec!(ErrorNotice);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlEnvelope;

    #[test]
    fn hello_roundtrip_defaults_version() {
        let hello = Hello::new("bearer-abc", ChannelKind::Presence);
        let envelope: ControlEnvelope = (&hello).try_into().expect("encode");
        assert!(envelope.properties.get("resume_after").is_some());
        let decoded = Hello::try_from(&envelope).expect("decode");
        assert_eq!(decoded.channel, ChannelKind::Presence);
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert!(decoded.resume_after.is_none());
    }

    #[test]
    fn hello_tolerates_missing_optional_fields() {
        let envelope = ControlEnvelope {
            properties: serde_json::json!({
                "token": "bearer-abc",
                "channel": "messaging",
            }),
        };
        let decoded = Hello::try_from(&envelope).expect("decode");
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert!(decoded.resume_after.is_none());
    }

    #[test]
    fn reject_code_credential_classification() {
        assert!(RejectCode::InvalidToken.is_credential());
        assert!(!RejectCode::UnsupportedChannel.is_credential());
        assert!(!RejectCode::Malformed.is_credential());
    }

    #[test]
    fn welcome_roundtrip() {
        let welcome = Welcome {
            session_id: "sess-1".to_string(),
            principal_id: "alice".to_string(),
            channel: ChannelKind::Signaling,
            heartbeat_seconds: 30,
        };
        let envelope: ControlEnvelope = (&welcome).try_into().expect("encode");
        let decoded = Welcome::try_from(&envelope).expect("decode");
        assert_eq!(decoded.principal_id, "alice");
        assert_eq!(decoded.heartbeat_seconds, 30);
    }
}
