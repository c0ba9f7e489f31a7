//! Call-signaling wire messages. Every message carries the call id it
//! belongs to; the channel itself is call-agnostic.

use crate::impl_control_codec;
use serde::{Deserialize, Serialize};

/// Media kinds requested for a call. Audio-only is the default profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMedia {
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
}

impl CallMedia {
    pub fn audio_only() -> Self {
        CallMedia {
            audio: true,
            video: false,
        }
    }

    pub fn audio_video() -> Self {
        CallMedia {
            audio: true,
            video: true,
        }
    }
}

impl Default for CallMedia {
    fn default() -> Self {
        CallMedia::audio_only()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRejectReason {
    Busy,
    Decline,
    Unsupported,
    Unreachable,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    Hangup,
    Cancel,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Call states as reported over the wire in [`CallStateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStateTag {
    Idle,
    Inviting,
    Ringing,
    Answered,
    Rejected,
    Cancelled,
    TimedOut,
    Connected,
    Ended,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInvite {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    #[serde(default)]
    pub media: CallMedia,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAnswer {
    pub call_id: String,
    #[serde(default)]
    pub media: Option<CallMedia>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReject {
    pub call_id: String,
    pub reason: CallRejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHangup {
    pub call_id: String,
    pub reason: HangupReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpExchange {
    pub call_id: String,
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub call_id: String,
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStateChanged {
    pub call_id: String,
    pub state: CallStateTag,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Closed union of everything the signaling channel carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum SignalMessage {
    Invite(CallInvite),
    Answer(CallAnswer),
    Reject(CallReject),
    Hangup(CallHangup),
    Sdp(SdpExchange),
    Ice(IceCandidate),
    State(CallStateChanged),
}

impl SignalMessage {
    pub fn call_id(&self) -> &str {
        match self {
            Self::Invite(msg) => &msg.call_id,
            Self::Answer(msg) => &msg.call_id,
            Self::Reject(msg) => &msg.call_id,
            Self::Hangup(msg) => &msg.call_id,
            Self::Sdp(msg) => &msg.call_id,
            Self::Ice(msg) => &msg.call_id,
            Self::State(msg) => &msg.call_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Invite(_) => "invite",
            Self::Answer(_) => "answer",
            Self::Reject(_) => "reject",
            Self::Hangup(_) => "hangup",
            Self::Sdp(_) => "sdp",
            Self::Ice(_) => "ice",
            Self::State(_) => "state",
        }
    }
}

impl_control_codec!(SignalMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlEnvelope;

    #[test]
    fn invite_roundtrip() {
        let invite = SignalMessage::Invite(CallInvite {
            call_id: "call-123".to_string(),
            caller: "alice".to_string(),
            callee: "bob".to_string(),
            media: CallMedia::audio_video(),
            expires_at: Some(1_700_000_000),
        });
        let envelope: ControlEnvelope = (&invite).try_into().expect("encode");
        assert_eq!(
            envelope.properties.get("signal").and_then(|v| v.as_str()),
            Some("invite")
        );
        let decoded = SignalMessage::try_from(&envelope).expect("decode");
        assert_eq!(decoded, invite);
        assert_eq!(decoded.call_id(), "call-123");
    }

    #[test]
    fn ice_candidate_optional_fields() {
        let envelope = ControlEnvelope {
            properties: serde_json::json!({
                "signal": "ice",
                "call_id": "call-9",
                "candidate": "candidate:0 1 UDP 2122252543 198.51.100.4 61665 typ host",
            }),
        };
        let decoded = SignalMessage::try_from(&envelope).expect("decode");
        match decoded {
            SignalMessage::Ice(ice) => {
                assert!(ice.sdp_mid.is_none());
                assert!(ice.sdp_mline_index.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn reject_reason_roundtrip() {
        let reject = SignalMessage::Reject(CallReject {
            call_id: "call-5".to_string(),
            reason: CallRejectReason::Busy,
        });
        let envelope: ControlEnvelope = (&reject).try_into().expect("encode");
        let decoded = SignalMessage::try_from(&envelope).expect("decode");
        match decoded {
            SignalMessage::Reject(msg) => assert_eq!(msg.reason, CallRejectReason::Busy),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn sdp_exchange_roundtrip() {
        let sdp = SignalMessage::Sdp(SdpExchange {
            call_id: "call-7".to_string(),
            sdp_type: SdpType::Offer,
            sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_string(),
        });
        let envelope: ControlEnvelope = (&sdp).try_into().expect("encode");
        let decoded = SignalMessage::try_from(&envelope).expect("decode");
        assert_eq!(decoded, sdp);
    }

    #[test]
    fn unknown_signal_tag_fails_decode() {
        let envelope = ControlEnvelope {
            properties: serde_json::json!({
                "signal": "smoke",
                "call_id": "call-1",
            }),
        };
        assert!(SignalMessage::try_from(&envelope).is_err());
    }

    #[test]
    fn state_changed_carries_reason() {
        let state = SignalMessage::State(CallStateChanged {
            call_id: "call-2".to_string(),
            state: CallStateTag::Ringing,
            reason: None,
        });
        let envelope: ControlEnvelope = (&state).try_into().expect("encode");
        let decoded = SignalMessage::try_from(&envelope).expect("decode");
        match decoded {
            SignalMessage::State(msg) => {
                assert_eq!(msg.state, CallStateTag::Ringing);
                assert!(msg.reason.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
