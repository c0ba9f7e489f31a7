//! Media engine boundary.
//!
//! The engine owns capture, codecs, and transport; the call service only
//! orchestrates it. Description generation is asynchronous: `create_offer`
//! and `create_answer` return once the request is accepted, and the result
//! arrives later as [`MediaEvent::LocalDescriptionReady`].

use async_trait::async_trait;
use thiserror::Error;
use volant_proto::signal::{CallMedia, IceCandidate, SdpType};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media engine failure: {0}")]
    Engine(String),

    #[error("unknown media session: {0}")]
    UnknownSession(String),
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    LocalDescriptionReady {
        call_id: String,
        sdp_type: SdpType,
        sdp: String,
    },
    IceCandidateReady {
        call_id: String,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
    RemoteTrackAdded {
        call_id: String,
        video: bool,
    },
    Connected {
        call_id: String,
    },
    Failed {
        call_id: String,
        message: String,
    },
}

impl MediaEvent {
    pub fn call_id(&self) -> &str {
        match self {
            Self::LocalDescriptionReady { call_id, .. }
            | Self::IceCandidateReady { call_id, .. }
            | Self::RemoteTrackAdded { call_id, .. }
            | Self::Connected { call_id }
            | Self::Failed { call_id, .. } => call_id,
        }
    }
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Starts local media acquisition and offer generation for a call.
    async fn create_offer(&self, call_id: &str, media: CallMedia) -> Result<(), MediaError>;

    /// Starts answer generation; a remote offer must have been applied.
    async fn create_answer(&self, call_id: &str, media: CallMedia) -> Result<(), MediaError>;

    async fn set_remote_description(
        &self,
        call_id: &str,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<(), MediaError>;

    async fn add_ice_candidate(
        &self,
        call_id: &str,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Releases every local resource of the call. Must be safe to call on
    /// an unknown or already released call.
    async fn release(&self, call_id: &str);
}
