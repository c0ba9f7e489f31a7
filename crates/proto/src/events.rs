//! Push-delivered domain events and the backfill request/response pair.
//!
//! Event kinds form one closed enum; routing, dispatch tables, and storage
//! all key off it, so adding a kind is a compile-visible change everywhere.

use crate::{impl_control_codec, ChannelKind, CodecError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Direct,
    Group,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Direct => "direct",
            ScopeKind::Group => "group",
        }
    }
}

impl FromStr for ScopeKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "direct" => Ok(ScopeKind::Direct),
            "group" => Ok(ScopeKind::Group),
            _ => Err(CodecError::InvalidControlJson),
        }
    }
}

/// Recipient scope of an event. Sequence numbers are strictly increasing
/// within one scope and never compared across scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventScope {
    pub kind: ScopeKind,
    pub id: String,
}

impl EventScope {
    pub fn direct(user_id: impl Into<String>) -> Self {
        EventScope {
            kind: ScopeKind::Direct,
            id: user_id.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        EventScope {
            kind: ScopeKind::Group,
            id: group_id.into(),
        }
    }

    /// Stable key used for sequence counters and dedup maps.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.id)
    }
}

impl Display for EventScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageReceived,
    MessageSent,
    MessageRecalled,
    MessageRead,
    MessageEdited,
    PresenceChanged,
    Typing,
    FriendRequested,
    FriendAccepted,
    FriendRemoved,
    GroupCreated,
    GroupDeleted,
    GroupMemberJoined,
    GroupMemberLeft,
    GroupMemberKicked,
    GroupRoleChanged,
    GroupAnnouncementSet,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::MessageSent => "message_sent",
            Self::MessageRecalled => "message_recalled",
            Self::MessageRead => "message_read",
            Self::MessageEdited => "message_edited",
            Self::PresenceChanged => "presence_changed",
            Self::Typing => "typing",
            Self::FriendRequested => "friend_requested",
            Self::FriendAccepted => "friend_accepted",
            Self::FriendRemoved => "friend_removed",
            Self::GroupCreated => "group_created",
            Self::GroupDeleted => "group_deleted",
            Self::GroupMemberJoined => "group_member_joined",
            Self::GroupMemberLeft => "group_member_left",
            Self::GroupMemberKicked => "group_member_kicked",
            Self::GroupRoleChanged => "group_role_changed",
            Self::GroupAnnouncementSet => "group_announcement_set",
        }
    }

    /// The channel an event of this kind is pushed on.
    pub fn channel(self) -> ChannelKind {
        match self {
            Self::PresenceChanged | Self::Typing => ChannelKind::Presence,
            _ => ChannelKind::Messaging,
        }
    }

    pub const ALL: [EventKind; 17] = [
        Self::MessageReceived,
        Self::MessageSent,
        Self::MessageRecalled,
        Self::MessageRead,
        Self::MessageEdited,
        Self::PresenceChanged,
        Self::Typing,
        Self::FriendRequested,
        Self::FriendAccepted,
        Self::FriendRemoved,
        Self::GroupCreated,
        Self::GroupDeleted,
        Self::GroupMemberJoined,
        Self::GroupMemberLeft,
        Self::GroupMemberKicked,
        Self::GroupRoleChanged,
        Self::GroupAnnouncementSet,
    ];
}

impl FromStr for EventKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value)
            .ok_or(CodecError::InvalidControlJson)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One domain event as pushed to clients and persisted in the event log.
///
/// `occurred_at` is unix milliseconds; the wire stays free of timezone
/// formats and the storage layer owns calendar types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub scope: EventScope,
    pub sequence: u64,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub scope: EventScope,
    pub after_sequence: u64,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillResponse {
    pub scope: EventScope,
    pub events: Vec<PushEvent>,
    /// False when the server truncated at `limit`; the client should ask
    /// again from the last returned sequence.
    pub complete: bool,
}

impl_control_codec!(PushEvent);
impl_control_codec!(BackfillRequest);
impl_control_codec!(BackfillResponse);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlEnvelope;

    #[test]
    fn kind_string_roundtrip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(EventKind::from_str("message_exploded").is_err());
    }

    #[test]
    fn presence_kinds_route_to_presence_channel() {
        assert_eq!(EventKind::PresenceChanged.channel(), ChannelKind::Presence);
        assert_eq!(EventKind::Typing.channel(), ChannelKind::Presence);
        assert_eq!(EventKind::MessageReceived.channel(), ChannelKind::Messaging);
        assert_eq!(EventKind::GroupDeleted.channel(), ChannelKind::Messaging);
    }

    #[test]
    fn push_event_roundtrip() {
        let event = PushEvent {
            event_id: "evt-1".to_string(),
            kind: EventKind::MessageReceived,
            scope: EventScope::group("grp-7"),
            sequence: 42,
            payload: serde_json::json!({"message_id": "msg-9", "body": "hi"}),
            occurred_at: 1_700_000_000_000,
        };
        let envelope: ControlEnvelope = (&event).try_into().expect("encode");
        let decoded = PushEvent::try_from(&envelope).expect("decode");
        assert_eq!(decoded, event);
        assert_eq!(decoded.scope.key(), "group:grp-7");
    }

    #[test]
    fn unknown_kind_fails_decode() {
        let envelope = ControlEnvelope {
            properties: serde_json::json!({
                "event_id": "evt-1",
                "kind": "carrier_pigeon",
                "scope": {"kind": "direct", "id": "u1"},
                "sequence": 1,
                "occurred_at": 0,
            }),
        };
        assert!(PushEvent::try_from(&envelope).is_err());
    }

    #[test]
    fn backfill_roundtrip() {
        let request = BackfillRequest {
            scope: EventScope::direct("alice"),
            after_sequence: 10,
            limit: 100,
        };
        let envelope: ControlEnvelope = (&request).try_into().expect("encode");
        let decoded = BackfillRequest::try_from(&envelope).expect("decode");
        assert_eq!(decoded.after_sequence, 10);
        assert_eq!(decoded.scope, EventScope::direct("alice"));
    }
}
