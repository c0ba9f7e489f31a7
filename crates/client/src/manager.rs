//! Per-channel connection ownership.
//!
//! Each started channel runs one worker task that owns the link for its
//! whole life: connect, handshake, pump, reconnect. Credentials are
//! fetched fresh on every attempt. Transport failures surface only as
//! [`LinkState`] changes on the channel's watch; the worker keeps retrying
//! on the bounded schedule until `stop`.

use crate::backoff::ReconnectSchedule;
use crate::credential::CredentialProvider;
use crate::dispatch::EventDispatcher;
use crate::heartbeat::{Heartbeat, HeartbeatConfig};
use crate::transport::{FrameLink, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use volant_proto::events::{BackfillRequest, BackfillResponse, EventScope, PushEvent};
use volant_proto::handshake::{ErrorNotice, HandshakeReject, Hello, Welcome};
use volant_proto::signal::SignalMessage;
use volant_proto::{ChannelKind, Frame, FramePayload, FrameType};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("channel {0} is not started")]
    NotStarted(ChannelKind),

    #[error("channel {0} is already started")]
    AlreadyStarted(ChannelKind),

    #[error("channel send queue closed")]
    ChannelClosed,

    #[error("frame codec failure: {0}")]
    Codec(String),
}

/// Connectivity as shown to the application; never an error, always a
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting(u32),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub schedule: ReconnectSchedule,
    pub heartbeat: HeartbeatConfig,
    pub handshake_timeout: Duration,
    pub send_queue_depth: usize,
    pub signal_queue_depth: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            schedule: ReconnectSchedule::default(),
            heartbeat: HeartbeatConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            send_queue_depth: 64,
            signal_queue_depth: 64,
        }
    }
}

struct ChannelHandle {
    worker: JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
    outbound_tx: mpsc::Sender<Frame>,
    state_rx: watch::Receiver<LinkState>,
}

type SharedSignalSender = Arc<Mutex<Option<mpsc::Sender<SignalMessage>>>>;

pub struct ConnectionManager {
    config: ClientConfig,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    channels: Mutex<HashMap<ChannelKind, ChannelHandle>>,
    signal_tx: SharedSignalSender,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        credentials: Arc<dyn CredentialProvider>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        ConnectionManager {
            config,
            credentials,
            transport,
            dispatcher,
            channels: Mutex::new(HashMap::new()),
            signal_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Receiver for inbound signaling messages. Intended for the call
    /// service; installing a new inbox replaces the previous one.
    pub fn signal_inbox(&self) -> mpsc::Receiver<SignalMessage> {
        let (tx, rx) = mpsc::channel(self.config.signal_queue_depth);
        *self.signal_tx.lock().expect("signal inbox lock") = Some(tx);
        rx
    }

    /// Starts the worker for one channel and returns its state watch.
    pub fn start(&self, kind: ChannelKind) -> Result<watch::Receiver<LinkState>, ClientError> {
        let mut channels = self.channels.lock().expect("channel table lock");
        if channels.contains_key(&kind) {
            return Err(ClientError::AlreadyStarted(kind));
        }
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.send_queue_depth);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let ctx = ChannelContext {
            kind,
            url: self.config.url.clone(),
            schedule: self.config.schedule.clone(),
            heartbeat: self.config.heartbeat.clone(),
            handshake_timeout: self.config.handshake_timeout,
            credentials: self.credentials.clone(),
            transport: self.transport.clone(),
            dispatcher: self.dispatcher.clone(),
            signal_tx: self.signal_tx.clone(),
            state_tx,
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            shutdown_rx,
        };
        let worker = tokio::spawn(run_channel(ctx));
        channels.insert(
            kind,
            ChannelHandle {
                worker,
                shutdown_tx,
                outbound_tx,
                state_rx: state_rx.clone(),
            },
        );
        Ok(state_rx)
    }

    /// Tears one channel down cleanly and waits for its worker to finish.
    pub async fn stop(&self, kind: ChannelKind) -> Result<(), ClientError> {
        let handle = {
            let mut channels = self.channels.lock().expect("channel table lock");
            channels.remove(&kind).ok_or(ClientError::NotStarted(kind))?
        };
        let _ = handle.shutdown_tx.send(()).await;
        let _ = handle.worker.await;
        Ok(())
    }

    pub fn link_state(&self, kind: ChannelKind) -> Option<watch::Receiver<LinkState>> {
        let channels = self.channels.lock().expect("channel table lock");
        channels.get(&kind).map(|handle| handle.state_rx.clone())
    }

    pub async fn send_signal(&self, message: &SignalMessage) -> Result<(), ClientError> {
        let frame = Frame::control(ChannelKind::Signaling, FrameType::Signal, message)
            .map_err(|error| ClientError::Codec(error.to_string()))?;
        self.send_frame(ChannelKind::Signaling, frame).await
    }

    /// Pulls missed events for one scope; the response flows through the
    /// dispatcher like live pushes, so duplicates collapse on sequence.
    pub async fn request_backfill(
        &self,
        scope: EventScope,
        after_sequence: u64,
        limit: u32,
    ) -> Result<(), ClientError> {
        let request = BackfillRequest {
            scope,
            after_sequence,
            limit,
        };
        let frame = Frame::control(ChannelKind::Messaging, FrameType::BackfillRequest, &request)
            .map_err(|error| ClientError::Codec(error.to_string()))?;
        self.send_frame(ChannelKind::Messaging, frame).await
    }

    async fn send_frame(&self, kind: ChannelKind, frame: Frame) -> Result<(), ClientError> {
        let sender = {
            let channels = self.channels.lock().expect("channel table lock");
            channels
                .get(&kind)
                .map(|handle| handle.outbound_tx.clone())
                .ok_or(ClientError::NotStarted(kind))?
        };
        sender
            .send(frame)
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }
}

struct ChannelContext {
    kind: ChannelKind,
    url: String,
    schedule: ReconnectSchedule,
    heartbeat: HeartbeatConfig,
    handshake_timeout: Duration,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    signal_tx: SharedSignalSender,
    state_tx: watch::Sender<LinkState>,
    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: mpsc::Receiver<Frame>,
    shutdown_rx: mpsc::Receiver<()>,
}

enum HandshakeFailure {
    Rejected(HandshakeReject),
    Malformed,
}

async fn run_channel(ctx: ChannelContext) {
    let ChannelContext {
        kind,
        url,
        schedule,
        heartbeat,
        handshake_timeout,
        credentials,
        transport,
        dispatcher,
        signal_tx,
        state_tx,
        outbound_tx,
        mut outbound_rx,
        mut shutdown_rx,
    } = ctx;

    let mut attempt: u32 = 0;
    let mut principal: Option<String> = None;
    'outer: loop {
        let delay = schedule.delay_for(attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => break 'outer,
            }
        }
        let _ = state_tx.send(if attempt == 0 {
            LinkState::Connecting
        } else {
            LinkState::Reconnecting(attempt)
        });

        // The credential is fetched per attempt and never cached past the
        // handshake, so revocation bites on the next reconnect.
        let Some(token) = credentials.current_token() else {
            debug!(channel = %kind, "no credential available yet");
            attempt += 1;
            continue;
        };
        let mut link = match transport.connect(&url).await {
            Ok(link) => link,
            Err(error) => {
                warn!(channel = %kind, attempt, error = %error, "connect failed");
                attempt += 1;
                continue;
            }
        };

        let mut hello = Hello::new(token, kind);
        if kind == ChannelKind::Messaging {
            hello.resume_after = principal
                .as_deref()
                .map(|principal| dispatcher.last_applied(&EventScope::direct(principal)))
                .filter(|sequence| *sequence > 0);
        }
        let hello_frame = match Frame::control(kind, FrameType::Hello, &hello) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(channel = %kind, error = %error, "hello not encodable");
                attempt += 1;
                continue;
            }
        };
        if let Err(error) = link.send(hello_frame).await {
            warn!(channel = %kind, error = %error, "hello send failed");
            attempt += 1;
            continue;
        }
        let welcome = match timeout(handshake_timeout, link.recv()).await {
            Err(_) => {
                warn!(channel = %kind, "handshake timed out");
                attempt += 1;
                continue;
            }
            Ok(Err(error)) => {
                warn!(channel = %kind, error = %error, "handshake read failed");
                attempt += 1;
                continue;
            }
            Ok(Ok(None)) => {
                warn!(channel = %kind, "closed during handshake");
                attempt += 1;
                continue;
            }
            Ok(Ok(Some(frame))) => match parse_welcome(frame) {
                Ok(welcome) => welcome,
                Err(HandshakeFailure::Rejected(reject)) => {
                    if reject.code.is_credential() {
                        warn!(channel = %kind, "credential rejected; a fresh token backs the next attempt");
                    } else {
                        warn!(
                            channel = %kind,
                            code = ?reject.code,
                            message = %reject.message,
                            "handshake rejected"
                        );
                    }
                    attempt += 1;
                    continue;
                }
                Err(HandshakeFailure::Malformed) => {
                    warn!(channel = %kind, "malformed handshake response");
                    attempt += 1;
                    continue;
                }
            },
        };
        principal = Some(welcome.principal_id.clone());
        attempt = 0;
        let _ = state_tx.send(LinkState::Connected);
        info!(
            channel = %kind,
            principal = %welcome.principal_id,
            session = %welcome.session_id,
            "channel connected"
        );

        let mut pong_tx = None;
        let mut heartbeat_stop = None;
        if kind.requires_heartbeat() {
            let (ptx, prx) = mpsc::channel(8);
            let (stx, srx) = mpsc::channel(1);
            let task = Heartbeat::new(heartbeat.clone(), kind, outbound_tx.clone(), prx, srx);
            tokio::spawn(task.run());
            pong_tx = Some(ptx);
            heartbeat_stop = Some(stx);
        }

        let clean_stop = 'pump: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    link.close().await;
                    break 'pump true;
                }
                outgoing = outbound_rx.recv() => {
                    let Some(frame) = outgoing else {
                        link.close().await;
                        break 'pump true;
                    };
                    if let Err(error) = link.send(frame).await {
                        warn!(channel = %kind, error = %error, "frame send failed");
                        break 'pump false;
                    }
                }
                incoming = link.recv() => {
                    match incoming {
                        Ok(Some(frame)) => {
                            handle_frame(kind, &dispatcher, &signal_tx, pong_tx.as_ref(), frame);
                        }
                        Ok(None) => {
                            debug!(channel = %kind, "server closed the link");
                            break 'pump false;
                        }
                        Err(error) => {
                            warn!(channel = %kind, error = %error, "link read failed");
                            break 'pump false;
                        }
                    }
                }
            }
        };

        if let Some(stop) = heartbeat_stop {
            let _ = stop.try_send(());
        }
        if clean_stop {
            break 'outer;
        }
    }
    let _ = state_tx.send(LinkState::Disconnected);
    debug!(channel = %kind, "channel worker finished");
}

fn parse_welcome(frame: Frame) -> Result<Welcome, HandshakeFailure> {
    match frame.frame_type {
        FrameType::Welcome => {
            let FramePayload::Control(envelope) = frame.payload else {
                return Err(HandshakeFailure::Malformed);
            };
            Welcome::try_from(&envelope).map_err(|_| HandshakeFailure::Malformed)
        }
        FrameType::Error => {
            let FramePayload::Control(envelope) = frame.payload else {
                return Err(HandshakeFailure::Malformed);
            };
            HandshakeReject::try_from(&envelope)
                .map(|reject| Err(HandshakeFailure::Rejected(reject)))
                .unwrap_or(Err(HandshakeFailure::Malformed))
        }
        _ => Err(HandshakeFailure::Malformed),
    }
}

/// Applies one inbound frame. Decode failures and handler errors are
/// isolated per frame; nothing here tears the pump down.
fn handle_frame(
    kind: ChannelKind,
    dispatcher: &Arc<EventDispatcher>,
    signal_tx: &SharedSignalSender,
    pong_tx: Option<&mpsc::Sender<Vec<u8>>>,
    frame: Frame,
) {
    match frame.frame_type {
        FrameType::Event => {
            let FramePayload::Control(envelope) = frame.payload else {
                warn!(channel = %kind, "event frame without control payload");
                return;
            };
            match PushEvent::try_from(&envelope) {
                Ok(event) => {
                    dispatcher.dispatch(&event);
                }
                Err(error) => {
                    warn!(channel = %kind, error = %error, "undecodable event dropped");
                }
            }
        }
        FrameType::BackfillResponse => {
            let FramePayload::Control(envelope) = frame.payload else {
                warn!(channel = %kind, "backfill frame without control payload");
                return;
            };
            match BackfillResponse::try_from(&envelope) {
                Ok(response) => {
                    for event in &response.events {
                        dispatcher.dispatch(event);
                    }
                    if !response.complete {
                        debug!(scope = %response.scope, "backfill truncated, more to pull");
                    }
                }
                Err(error) => {
                    warn!(channel = %kind, error = %error, "undecodable backfill dropped");
                }
            }
        }
        FrameType::Pong => {
            if let (Some(tx), FramePayload::Opaque(payload)) = (pong_tx, frame.payload) {
                let _ = tx.try_send(payload);
            }
        }
        FrameType::Signal => {
            let FramePayload::Control(envelope) = frame.payload else {
                warn!(channel = %kind, "signal frame without control payload");
                return;
            };
            match SignalMessage::try_from(&envelope) {
                Ok(message) => {
                    let inbox = signal_tx.lock().expect("signal inbox lock");
                    match inbox.as_ref() {
                        Some(tx) => {
                            if tx.try_send(message).is_err() {
                                warn!(channel = %kind, "signal inbox unavailable, message dropped");
                            }
                        }
                        None => debug!(channel = %kind, "no signal consumer installed"),
                    }
                }
                Err(error) => {
                    warn!(channel = %kind, error = %error, "undecodable signal dropped");
                }
            }
        }
        FrameType::Error => {
            let FramePayload::Control(envelope) = frame.payload else {
                return;
            };
            if let Ok(notice) = ErrorNotice::try_from(&envelope) {
                warn!(channel = %kind, code = %notice.code, message = %notice.message, "server error notice");
            }
        }
        other => {
            debug!(channel = %kind, frame_type = ?other, "unexpected frame dropped");
        }
    }
}
