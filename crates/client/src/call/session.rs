//! Per-call session state.
//!
//! The transition function is total: every state/trigger pair yields either
//! a next state or a typed [`TransitionError`] the caller can branch on.
//! The one deliberate no-op is hangup on an already terminal session.

use crate::call::TerminationReason;
use std::time::Instant;
use thiserror::Error;
use volant_proto::signal::{CallMedia, CallStateTag, IceCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Inviting,
    Ringing,
    Answered,
    Connected,
    Ended,
    Rejected,
    Cancelled,
    TimedOut,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Rejected | Self::Cancelled | Self::TimedOut | Self::Failed
        )
    }

    pub fn as_tag(self) -> CallStateTag {
        match self {
            Self::Idle => CallStateTag::Idle,
            Self::Inviting => CallStateTag::Inviting,
            Self::Ringing => CallStateTag::Ringing,
            Self::Answered => CallStateTag::Answered,
            Self::Connected => CallStateTag::Connected,
            Self::Ended => CallStateTag::Ended,
            Self::Rejected => CallStateTag::Rejected,
            Self::Cancelled => CallStateTag::Cancelled,
            Self::TimedOut => CallStateTag::TimedOut,
            Self::Failed => CallStateTag::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTrigger {
    /// Local actor sent the invite.
    InviteSent,
    /// An invite arrived for us.
    InviteReceived,
    /// Transport acknowledged invite delivery to the callee.
    InviteDelivered,
    /// Callee accepted (locally or via the wire).
    Answer,
    Reject,
    /// Caller withdrew before an answer.
    Cancel,
    RingTimeout,
    /// Media engine reports a working candidate pair.
    MediaConnected,
    Hangup,
    Failure,
}

impl CallTrigger {
    pub fn label(self) -> &'static str {
        match self {
            Self::InviteSent => "invite_sent",
            Self::InviteReceived => "invite_received",
            Self::InviteDelivered => "invite_delivered",
            Self::Answer => "answer",
            Self::Reject => "reject",
            Self::Cancel => "cancel",
            Self::RingTimeout => "ring_timeout",
            Self::MediaConnected => "media_connected",
            Self::Hangup => "hangup",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("no transition from {from:?} on {trigger}")]
    Invalid {
        from: CallState,
        trigger: &'static str,
    },
}

/// The complete transition table.
pub fn transition(state: CallState, trigger: CallTrigger) -> Result<CallState, TransitionError> {
    use CallState::*;
    use CallTrigger::*;
    let next = match (state, trigger) {
        (Idle, InviteSent) => Inviting,
        (Idle, InviteReceived) => Ringing,
        (Idle, Failure) => Failed,

        (Inviting, InviteDelivered) => Ringing,
        // The answer can outrun the delivery acknowledgement.
        (Inviting, Answer) => Answered,
        (Inviting, Reject) => Rejected,
        (Inviting, Cancel) | (Inviting, Hangup) => Cancelled,
        (Inviting, RingTimeout) => TimedOut,
        (Inviting, Failure) => Failed,

        (Ringing, InviteDelivered) => Ringing,
        (Ringing, Answer) => Answered,
        (Ringing, Reject) => Rejected,
        (Ringing, Cancel) | (Ringing, Hangup) => Cancelled,
        (Ringing, RingTimeout) => TimedOut,
        (Ringing, Failure) => Failed,

        (Answered, MediaConnected) => Connected,
        (Answered, Hangup) => Ended,
        (Answered, Failure) => Failed,

        (Connected, MediaConnected) => Connected,
        (Connected, Hangup) => Ended,
        (Connected, Failure) => Failed,

        (from, Hangup) if from.is_terminal() => from,

        (from, trigger) => {
            return Err(TransitionError::Invalid {
                from,
                trigger: trigger.label(),
            })
        }
    };
    Ok(next)
}

pub struct CallSession {
    pub call_id: String,
    pub peer: String,
    pub role: Role,
    pub media: CallMedia,
    pub state: CallState,
    pub created_at: Instant,
    pub last_transition_at: Instant,
    pub termination: Option<TerminationReason>,
    /// Candidates that arrived before the remote description; applied in
    /// arrival order once it lands.
    pub pending_candidates: Vec<IceCandidate>,
    pub remote_description_set: bool,
    pub local_description_sent: bool,
    pub media_released: bool,
}

impl CallSession {
    pub fn new(call_id: String, peer: String, role: Role, media: CallMedia) -> Self {
        let now = Instant::now();
        CallSession {
            call_id,
            peer,
            role,
            media,
            state: CallState::Idle,
            created_at: now,
            last_transition_at: now,
            termination: None,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            local_description_sent: false,
            media_released: false,
        }
    }

    pub fn apply(&mut self, trigger: CallTrigger) -> Result<CallState, TransitionError> {
        let next = transition(self.state, trigger)?;
        if next != self.state {
            self.state = next;
            self.last_transition_at = Instant::now();
        }
        Ok(next)
    }
}
