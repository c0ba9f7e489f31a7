//! Call signaling: per-call state machine and the service that drives it.

pub mod service;
pub mod session;

pub use service::{CallConfig, CallError, CallEvent, CallService};
pub use session::{CallSession, CallState, CallTrigger, Role, TransitionError};

use std::fmt::{Display, Formatter};
use volant_proto::signal::CallRejectReason;

/// Why a call reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    LocalHangup,
    RemoteHangup,
    Rejected(CallRejectReason),
    Cancelled,
    Timeout,
    Error,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalHangup => write!(f, "local_hangup"),
            Self::RemoteHangup => write!(f, "remote_hangup"),
            Self::Rejected(reason) => {
                let label = match reason {
                    CallRejectReason::Busy => "busy",
                    CallRejectReason::Decline => "decline",
                    CallRejectReason::Unsupported => "unsupported",
                    CallRejectReason::Unreachable => "unreachable",
                    CallRejectReason::Timeout => "timeout",
                    CallRejectReason::Error => "error",
                };
                write!(f, "rejected_{}", label)
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
        }
    }
}
