//! Call orchestration.
//!
//! One [`CallService`] per client coordinates every live call: it applies
//! signaling messages and media-engine events to the owning session,
//! forwards SDP and ICE to the peer, and runs the ring and
//! local-description timers. Each session sits behind its own mutex; the
//! signaling pump is sequential, so messages for one call apply in arrival
//! order, and timers serialize through the same lock.

use crate::call::session::{CallSession, CallState, CallTrigger, Role, TransitionError};
use crate::call::TerminationReason;
use crate::media::{MediaEngine, MediaError, MediaEvent};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::time::sleep;
use tracing::{debug, warn};
use volant_proto::signal::{
    CallAnswer, CallHangup, CallInvite, CallMedia, CallReject, CallRejectReason, CallStateTag,
    HangupReason, IceCandidate, SdpExchange, SdpType, SignalMessage,
};

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Caller-side wait for an answer before the call times out.
    pub ring_timeout: Duration,
    /// Bounded wait for the media engine to produce a local description.
    pub sdp_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        CallConfig {
            ring_timeout: Duration::from_secs(45),
            sdp_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("signaling channel unavailable")]
    SignalingUnavailable,

    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Application-facing call notifications.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Incoming {
        call_id: String,
        caller: String,
        media: CallMedia,
    },
    StateChanged {
        call_id: String,
        state: CallStateTag,
        reason: Option<String>,
    },
    RemoteTrack {
        call_id: String,
        video: bool,
    },
}

type SharedSession = Arc<Mutex<CallSession>>;

pub struct CallService {
    local_id: String,
    config: CallConfig,
    media: Arc<dyn MediaEngine>,
    outbound: mpsc::Sender<SignalMessage>,
    events_tx: mpsc::Sender<CallEvent>,
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl CallService {
    pub fn new(
        local_id: impl Into<String>,
        media: Arc<dyn MediaEngine>,
        outbound: mpsc::Sender<SignalMessage>,
        config: CallConfig,
    ) -> (Arc<Self>, mpsc::Receiver<CallEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        (
            Arc::new(CallService {
                local_id: local_id.into(),
                config,
                media,
                outbound,
                events_tx,
                sessions: RwLock::new(HashMap::new()),
            }),
            events_rx,
        )
    }

    /// Pumps inbound signaling and media events. Spawn once, with the
    /// receiver from `ConnectionManager::signal_inbox` and the engine's
    /// event stream.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<SignalMessage>,
        mut media_events: mpsc::Receiver<MediaEvent>,
    ) {
        loop {
            tokio::select! {
                message = signals.recv() => {
                    match message {
                        Some(message) => self.handle_signal(message).await,
                        None => return,
                    }
                }
                event = media_events.recv() => {
                    match event {
                        Some(event) => self.handle_media_event(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    pub fn active_calls(&self) -> usize {
        self.sessions.read().expect("session map lock").len()
    }

    /// Starts an outgoing call; returns its call id.
    pub async fn place_call(
        self: &Arc<Self>,
        callee: &str,
        media: CallMedia,
    ) -> Result<String, CallError> {
        let call_id = generate_call_id();
        let mut session = CallSession::new(
            call_id.clone(),
            callee.to_string(),
            Role::Caller,
            media,
        );
        session.apply(CallTrigger::InviteSent)?;
        let shared = Arc::new(Mutex::new(session));
        self.sessions
            .write()
            .expect("session map lock")
            .insert(call_id.clone(), shared);

        let invite = SignalMessage::Invite(CallInvite {
            call_id: call_id.clone(),
            caller: self.local_id.clone(),
            callee: callee.to_string(),
            media,
            expires_at: None,
        });
        if self.outbound.send(invite).await.is_err() {
            self.sessions
                .write()
                .expect("session map lock")
                .remove(&call_id);
            return Err(CallError::SignalingUnavailable);
        }
        self.emit(CallEvent::StateChanged {
            call_id: call_id.clone(),
            state: CallStateTag::Inviting,
            reason: None,
        });

        let service = self.clone();
        let ring_call = call_id.clone();
        let ring_timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            sleep(ring_timeout).await;
            service.ring_timeout_fired(&ring_call).await;
        });
        Ok(call_id)
    }

    /// Callee accepts a ringing call.
    pub async fn accept(self: &Arc<Self>, call_id: &str) -> Result<(), CallError> {
        let shared = self
            .session(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        let mut session = shared.lock().await;
        session.apply(CallTrigger::Answer)?;
        let answer = SignalMessage::Answer(CallAnswer {
            call_id: call_id.to_string(),
            media: Some(session.media),
        });
        if self.outbound.send(answer).await.is_err() {
            self.fail_locked(&mut session, "signaling unavailable").await;
            return Err(CallError::SignalingUnavailable);
        }
        self.emit(CallEvent::StateChanged {
            call_id: call_id.to_string(),
            state: CallStateTag::Answered,
            reason: None,
        });
        Ok(())
    }

    /// Callee declines a ringing call.
    pub async fn reject(
        self: &Arc<Self>,
        call_id: &str,
        reason: CallRejectReason,
    ) -> Result<(), CallError> {
        let shared = self
            .session(call_id)
            .ok_or_else(|| CallError::UnknownCall(call_id.to_string()))?;
        let mut session = shared.lock().await;
        session.apply(CallTrigger::Reject)?;
        let _ = self
            .outbound
            .send(SignalMessage::Reject(CallReject {
                call_id: call_id.to_string(),
                reason,
            }))
            .await;
        self.finish_locked(&mut session, TerminationReason::Rejected(reason))
            .await;
        Ok(())
    }

    /// Ends a call. Cancels pre-answer, hangs up after; a second hangup or
    /// one for an unknown call id is a successful no-op.
    pub async fn hangup(self: &Arc<Self>, call_id: &str) -> Result<(), CallError> {
        let Some(shared) = self.session(call_id) else {
            return Ok(());
        };
        let mut session = shared.lock().await;
        if session.state.is_terminal() {
            return Ok(());
        }
        let next = session.apply(CallTrigger::Hangup)?;
        let (wire_reason, termination) = match next {
            CallState::Cancelled => (HangupReason::Cancel, TerminationReason::Cancelled),
            _ => (HangupReason::Hangup, TerminationReason::LocalHangup),
        };
        let _ = self
            .outbound
            .send(SignalMessage::Hangup(CallHangup {
                call_id: call_id.to_string(),
                reason: wire_reason,
            }))
            .await;
        self.finish_locked(&mut session, termination).await;
        Ok(())
    }

    pub async fn handle_signal(self: &Arc<Self>, message: SignalMessage) {
        match message {
            SignalMessage::Invite(invite) => self.on_invite(invite).await,
            SignalMessage::State(state) => {
                if state.state == CallStateTag::Ringing {
                    self.on_delivery_ack(&state.call_id).await;
                } else {
                    debug!(call = %state.call_id, state = ?state.state, "peer state note");
                }
            }
            SignalMessage::Answer(answer) => self.on_answer(&answer.call_id).await,
            SignalMessage::Reject(reject) => self.on_reject(&reject.call_id, reject.reason).await,
            SignalMessage::Hangup(hangup) => self.on_hangup(&hangup.call_id, hangup.reason).await,
            SignalMessage::Sdp(sdp) => self.on_sdp(sdp).await,
            SignalMessage::Ice(ice) => self.on_ice(ice).await,
        }
    }

    pub async fn handle_media_event(self: &Arc<Self>, event: MediaEvent) {
        let call_id = event.call_id().to_string();
        match event {
            MediaEvent::LocalDescriptionReady { sdp_type, sdp, .. } => {
                let Some(shared) = self.session(&call_id) else {
                    debug!(call = %call_id, "description for finished call dropped");
                    return;
                };
                let mut session = shared.lock().await;
                if session.state.is_terminal() {
                    return;
                }
                session.local_description_sent = true;
                let message = SignalMessage::Sdp(SdpExchange {
                    call_id: call_id.clone(),
                    sdp_type,
                    sdp,
                });
                if self.outbound.send(message).await.is_err() {
                    self.fail_locked(&mut session, "signaling unavailable").await;
                }
            }
            MediaEvent::IceCandidateReady {
                candidate,
                sdp_mid,
                sdp_mline_index,
                ..
            } => {
                if self.session(&call_id).is_none() {
                    debug!(call = %call_id, "candidate for finished call dropped");
                    return;
                }
                let message = SignalMessage::Ice(IceCandidate {
                    call_id: call_id.clone(),
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                });
                if self.outbound.send(message).await.is_err() {
                    warn!(call = %call_id, "candidate not forwarded, signaling unavailable");
                }
            }
            MediaEvent::RemoteTrackAdded { video, .. } => {
                self.emit(CallEvent::RemoteTrack { call_id, video });
            }
            MediaEvent::Connected { .. } => {
                let Some(shared) = self.session(&call_id) else {
                    return;
                };
                let mut session = shared.lock().await;
                let before = session.state;
                match session.apply(CallTrigger::MediaConnected) {
                    Ok(CallState::Connected) if before != CallState::Connected => {
                        self.emit(CallEvent::StateChanged {
                            call_id,
                            state: CallStateTag::Connected,
                            reason: None,
                        });
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(call = %call_id, error = %error, "media connected out of turn");
                    }
                }
            }
            MediaEvent::Failed { message, .. } => {
                self.fail(&call_id, &message).await;
            }
        }
    }

    async fn on_invite(self: &Arc<Self>, invite: CallInvite) {
        {
            let sessions = self.sessions.read().expect("session map lock");
            if sessions.contains_key(&invite.call_id) {
                debug!(call = %invite.call_id, "duplicate invite dropped");
                return;
            }
        }
        let mut session = CallSession::new(
            invite.call_id.clone(),
            invite.caller.clone(),
            Role::Callee,
            invite.media,
        );
        if let Err(error) = session.apply(CallTrigger::InviteReceived) {
            warn!(call = %invite.call_id, error = %error, "invite rejected by state machine");
            return;
        }
        self.sessions
            .write()
            .expect("session map lock")
            .insert(invite.call_id.clone(), Arc::new(Mutex::new(session)));
        self.emit(CallEvent::Incoming {
            call_id: invite.call_id,
            caller: invite.caller,
            media: invite.media,
        });
    }

    async fn on_delivery_ack(self: &Arc<Self>, call_id: &str) {
        let Some(shared) = self.session(call_id) else {
            debug!(call = %call_id, "delivery ack for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        let before = session.state;
        match session.apply(CallTrigger::InviteDelivered) {
            Ok(CallState::Ringing) if before == CallState::Inviting => {
                self.emit(CallEvent::StateChanged {
                    call_id: call_id.to_string(),
                    state: CallStateTag::Ringing,
                    reason: None,
                });
            }
            Ok(_) => {}
            Err(error) => {
                debug!(call = %call_id, error = %error, "delivery ack out of turn");
            }
        }
    }

    async fn on_answer(self: &Arc<Self>, call_id: &str) {
        let Some(shared) = self.session(call_id) else {
            warn!(call = %call_id, "answer for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        if let Err(error) = session.apply(CallTrigger::Answer) {
            warn!(call = %call_id, error = %error, "answer out of turn");
            return;
        }
        self.emit(CallEvent::StateChanged {
            call_id: call_id.to_string(),
            state: CallStateTag::Answered,
            reason: None,
        });
        // Answered: acquire media and generate the offer, on a bounded
        // clock.
        let media = session.media;
        if let Err(error) = self.media.create_offer(call_id, media).await {
            self.fail_locked(&mut session, &error.to_string()).await;
            return;
        }
        self.arm_sdp_timer(call_id);
    }

    async fn on_reject(self: &Arc<Self>, call_id: &str, reason: CallRejectReason) {
        let Some(shared) = self.session(call_id) else {
            debug!(call = %call_id, "reject for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        if let Err(error) = session.apply(CallTrigger::Reject) {
            debug!(call = %call_id, error = %error, "reject out of turn");
            return;
        }
        self.finish_locked(&mut session, TerminationReason::Rejected(reason))
            .await;
    }

    async fn on_hangup(self: &Arc<Self>, call_id: &str, reason: HangupReason) {
        let Some(shared) = self.session(call_id) else {
            debug!(call = %call_id, "hangup for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        if session.state.is_terminal() {
            return;
        }
        let (trigger, termination) = match reason {
            HangupReason::Hangup => (CallTrigger::Hangup, TerminationReason::RemoteHangup),
            HangupReason::Cancel => (CallTrigger::Cancel, TerminationReason::Cancelled),
            HangupReason::Timeout => (CallTrigger::RingTimeout, TerminationReason::Timeout),
            HangupReason::Failure => (CallTrigger::Failure, TerminationReason::Error),
        };
        if let Err(error) = session.apply(trigger) {
            debug!(call = %call_id, error = %error, "hangup out of turn");
            return;
        }
        self.finish_locked(&mut session, termination).await;
    }

    async fn on_sdp(self: &Arc<Self>, sdp: SdpExchange) {
        let Some(shared) = self.session(&sdp.call_id) else {
            warn!(call = %sdp.call_id, "sdp for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        if session.state.is_terminal() {
            return;
        }
        if let Err(error) = self
            .media
            .set_remote_description(&sdp.call_id, sdp.sdp_type, &sdp.sdp)
            .await
        {
            self.fail_locked(&mut session, &error.to_string()).await;
            return;
        }
        session.remote_description_set = true;
        let queued: Vec<IceCandidate> = session.pending_candidates.drain(..).collect();
        for candidate in queued {
            if let Err(error) = self.media.add_ice_candidate(&sdp.call_id, &candidate).await {
                self.fail_locked(&mut session, &error.to_string()).await;
                return;
            }
        }
        if session.role == Role::Callee && sdp.sdp_type == SdpType::Offer {
            let media = session.media;
            if let Err(error) = self.media.create_answer(&sdp.call_id, media).await {
                self.fail_locked(&mut session, &error.to_string()).await;
                return;
            }
            self.arm_sdp_timer(&sdp.call_id);
        }
    }

    async fn on_ice(self: &Arc<Self>, ice: IceCandidate) {
        let Some(shared) = self.session(&ice.call_id) else {
            warn!(call = %ice.call_id, "candidate for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        if session.state.is_terminal() {
            return;
        }
        if session.remote_description_set {
            if let Err(error) = self.media.add_ice_candidate(&ice.call_id, &ice).await {
                self.fail_locked(&mut session, &error.to_string()).await;
            }
        } else {
            session.pending_candidates.push(ice);
        }
    }

    async fn ring_timeout_fired(self: &Arc<Self>, call_id: &str) {
        let Some(shared) = self.session(call_id) else {
            return;
        };
        let mut session = shared.lock().await;
        match session.apply(CallTrigger::RingTimeout) {
            Ok(CallState::TimedOut) => {
                let _ = self
                    .outbound
                    .send(SignalMessage::Hangup(CallHangup {
                        call_id: call_id.to_string(),
                        reason: HangupReason::Timeout,
                    }))
                    .await;
                self.finish_locked(&mut session, TerminationReason::Timeout)
                    .await;
            }
            _ => {
                // Answered or already terminal; the timer has nothing to do.
            }
        }
    }

    fn arm_sdp_timer(self: &Arc<Self>, call_id: &str) {
        let service = self.clone();
        let call_id = call_id.to_string();
        let wait = self.config.sdp_timeout;
        tokio::spawn(async move {
            sleep(wait).await;
            let Some(shared) = service.session(&call_id) else {
                return;
            };
            let mut session = shared.lock().await;
            if session.local_description_sent || session.state.is_terminal() {
                return;
            }
            service
                .fail_locked(&mut session, "local description timed out")
                .await;
        });
    }

    async fn fail(self: &Arc<Self>, call_id: &str, message: &str) {
        let Some(shared) = self.session(call_id) else {
            debug!(call = %call_id, "failure for unknown call dropped");
            return;
        };
        let mut session = shared.lock().await;
        self.fail_locked(&mut session, message).await;
    }

    /// Moves a session to `Failed`, tells the peer, and releases media.
    async fn fail_locked(&self, session: &mut MutexGuard<'_, CallSession>, message: &str) {
        if session.state.is_terminal() {
            return;
        }
        if session.apply(CallTrigger::Failure).is_err() {
            return;
        }
        warn!(call = %session.call_id, error = %message, "call failed");
        let _ = self
            .outbound
            .send(SignalMessage::Hangup(CallHangup {
                call_id: session.call_id.clone(),
                reason: HangupReason::Failure,
            }))
            .await;
        self.finish_locked(session, TerminationReason::Error).await;
    }

    /// Terminal bookkeeping: record the reason, release media exactly
    /// once, notify the app, and drop the session from the registry.
    async fn finish_locked(
        &self,
        session: &mut MutexGuard<'_, CallSession>,
        termination: TerminationReason,
    ) {
        if session.termination.is_none() {
            session.termination = Some(termination);
        }
        if !session.media_released {
            self.media.release(&session.call_id).await;
            session.media_released = true;
        }
        let reason = session.termination.expect("termination just set");
        self.emit(CallEvent::StateChanged {
            call_id: session.call_id.clone(),
            state: session.state.as_tag(),
            reason: Some(reason.to_string()),
        });
        self.sessions
            .write()
            .expect("session map lock")
            .remove(&session.call_id);
    }

    fn session(&self, call_id: &str) -> Option<SharedSession> {
        self.sessions
            .read()
            .expect("session map lock")
            .get(call_id)
            .cloned()
    }

    fn emit(&self, event: CallEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!("call event queue full, notification dropped");
        }
    }
}

fn generate_call_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
