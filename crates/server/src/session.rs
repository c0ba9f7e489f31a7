//! WebSocket session acceptor and per-connection frame pump.
//!
//! Each accepted socket must complete the Hello/Welcome handshake within a
//! deadline before it is registered with the router. After that a single
//! select loop owns the socket: outbound frames arrive on the connection's
//! queue, inbound frames are handled one at a time in arrival order. A bad
//! frame is logged and skipped; it never tears the session down.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::router::ChannelRouter;
use crate::signal::SignalGateway;
use crate::util::generate_id;
use futures_util::{SinkExt, StreamExt};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use volant_proto::events::{BackfillRequest, BackfillResponse, EventScope};
use volant_proto::handshake::{HandshakeReject, Hello, RejectCode, Welcome};
use volant_proto::signal::SignalMessage;
use volant_proto::{
    ChannelKind, Frame, FramePayload, FrameType, PROTOCOL_VERSION,
};
use volant_storage::EventLog;

const MAX_BACKFILL_LIMIT: usize = 500;

#[derive(Debug)]
pub enum SessionError {
    Codec,
    Storage,
    Transport,
}

impl Display for SessionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec => write!(f, "frame codec failure"),
            Self::Storage => write!(f, "storage failure"),
            Self::Transport => write!(f, "transport failure"),
        }
    }
}

impl Error for SessionError {}

pub struct ServerState {
    pub config: ServerConfig,
    pub metrics: Arc<Metrics>,
    pub router: Arc<ChannelRouter>,
    pub signals: Arc<SignalGateway>,
    pub authenticator: Arc<dyn Authenticator>,
    pub event_log: Arc<dyn EventLog>,
}

/// Accept loop. Each connection runs on its own task so one slow session
/// never delays the listener.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    info!("session acceptor listening");
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    debug!(peer = %peer, "connection accepted");
                    handle_socket(stream, state).await;
                });
            }
            Err(error) => {
                warn!(error = %error, "accept failed");
            }
        }
    }
}

async fn handle_socket(stream: TcpStream, state: Arc<ServerState>) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(error) => {
            debug!(error = %error, "websocket upgrade failed");
            return;
        }
    };

    let hello = match timeout(state.config.handshake_timeout, read_hello(&mut ws)).await {
        Ok(Ok(hello)) => hello,
        Ok(Err(reject)) => {
            send_reject(&mut ws, reject).await;
            return;
        }
        Err(_) => {
            debug!("handshake deadline expired");
            return;
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        send_reject(
            &mut ws,
            HandshakeReject {
                code: RejectCode::UnsupportedVersion,
                message: format!("expected protocol version {}", PROTOCOL_VERSION),
            },
        )
        .await;
        return;
    }

    let principal = match state.authenticator.authenticate(&hello.token).await {
        Ok(principal) => principal,
        Err(error) => {
            debug!(error = %error, "handshake rejected");
            send_reject(
                &mut ws,
                HandshakeReject {
                    code: RejectCode::InvalidToken,
                    message: "credential rejected".to_string(),
                },
            )
            .await;
            return;
        }
    };

    let channel = hello.channel;
    let session_id = generate_id(&format!("{}:{}", principal, channel));
    let welcome = Welcome {
        session_id: session_id.clone(),
        principal_id: principal.clone(),
        channel,
        heartbeat_seconds: state.config.heartbeat_seconds,
    };
    let frame = match Frame::control(channel, FrameType::Welcome, &welcome) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(error = %error, "welcome not encodable");
            return;
        }
    };
    if write_frame(&mut ws, &frame).await.is_err() {
        return;
    }

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Frame>(state.config.send_queue_depth);
    let connection_id = state
        .router
        .register(&principal, channel, outbound_tx.clone());
    state.metrics.incr_connections();
    info!(
        principal = %principal,
        channel = %channel,
        session = %session_id,
        connection = connection_id,
        "session established"
    );

    // A reconnecting client resumes its own direct scope immediately; gaps
    // in other scopes go through explicit backfill requests.
    if let Some(after) = hello.resume_after {
        if channel == ChannelKind::Messaging {
            if let Err(error) = enqueue_backfill(
                &state,
                &outbound_tx,
                channel,
                BackfillRequest {
                    scope: EventScope::direct(principal.clone()),
                    after_sequence: after,
                    limit: MAX_BACKFILL_LIMIT as u32,
                },
            )
            .await
            {
                warn!(error = %error, "resume backfill failed");
            }
        }
    }

    let (mut ws_tx, mut ws_rx) = ws.split();
    let connected_at = Instant::now();
    let mut last_activity = Instant::now();
    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(frame) = outgoing else { break };
                let encoded = match frame.encode() {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        warn!(error = %error, "outbound frame not encodable");
                        continue;
                    }
                };
                if ws_tx.send(Message::Binary(encoded)).await.is_err() {
                    break;
                }
                state.metrics.mark_egress();
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        state.metrics.mark_ingress();
                        last_activity = Instant::now();
                        if let Err(error) =
                            handle_client_frame(&state, &principal, channel, &data, &outbound_tx)
                                .await
                        {
                            state.metrics.mark_handler_failure();
                            warn!(
                                principal = %principal,
                                channel = %channel,
                                error = %error,
                                "client frame rejected"
                            );
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(error = %error, "socket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.router.unregister(&principal, connection_id);
    state.metrics.decr_connections();
    info!(
        principal = %principal,
        channel = %channel,
        connection = connection_id,
        uptime_secs = connected_at.elapsed().as_secs(),
        idle_secs = last_activity.elapsed().as_secs(),
        "session closed"
    );
}

async fn read_hello(
    ws: &mut WebSocketStream<TcpStream>,
) -> Result<Hello, HandshakeReject> {
    let malformed = |message: &str| HandshakeReject {
        code: RejectCode::Malformed,
        message: message.to_string(),
    };
    loop {
        let message = match ws.next().await {
            Some(Ok(message)) => message,
            _ => return Err(malformed("socket closed during handshake")),
        };
        let data = match message {
            Message::Binary(data) => data,
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Err(malformed("expected binary hello frame")),
        };
        let (frame, _) =
            Frame::decode(&data).map_err(|_| malformed("undecodable hello frame"))?;
        if frame.frame_type != FrameType::Hello {
            return Err(malformed("first frame must be hello"));
        }
        let FramePayload::Control(envelope) = frame.payload else {
            return Err(malformed("hello payload must be control json"));
        };
        let hello = Hello::try_from(&envelope).map_err(|_| malformed("invalid hello payload"))?;
        if hello.channel != frame.channel {
            return Err(malformed("hello channel mismatch"));
        }
        return Ok(hello);
    }
}

async fn send_reject(ws: &mut WebSocketStream<TcpStream>, reject: HandshakeReject) {
    debug!(code = ?reject.code, message = %reject.message, "rejecting handshake");
    if let Ok(frame) = Frame::control(ChannelKind::Messaging, FrameType::Error, &reject) {
        let _ = write_frame(ws, &frame).await;
    }
    let _ = ws.close(None).await;
}

async fn write_frame(
    ws: &mut WebSocketStream<TcpStream>,
    frame: &Frame,
) -> Result<(), SessionError> {
    let encoded = frame.encode().map_err(|_| SessionError::Codec)?;
    ws.send(Message::Binary(encoded))
        .await
        .map_err(|_| SessionError::Transport)
}

async fn handle_client_frame(
    state: &Arc<ServerState>,
    principal: &str,
    channel: ChannelKind,
    data: &[u8],
    reply: &mpsc::Sender<Frame>,
) -> Result<(), SessionError> {
    let (frame, _) = Frame::decode(data).map_err(|_| SessionError::Codec)?;
    if frame.channel != channel {
        warn!(
            principal = %principal,
            bound = %channel,
            got = %frame.channel,
            "frame for foreign channel dropped"
        );
        return Ok(());
    }
    match frame.frame_type {
        FrameType::Ping => {
            let pong = Frame {
                channel,
                sequence: 0,
                frame_type: FrameType::Pong,
                payload: frame.payload,
            };
            // A full queue sheds the pong; the client treats the silence as
            // one missed beat.
            let _ = reply.try_send(pong);
            Ok(())
        }
        FrameType::Signal if channel == ChannelKind::Signaling => {
            let FramePayload::Control(envelope) = frame.payload else {
                return Err(SessionError::Codec);
            };
            let message =
                SignalMessage::try_from(&envelope).map_err(|_| SessionError::Codec)?;
            state.signals.handle(principal, message);
            Ok(())
        }
        FrameType::BackfillRequest => {
            let FramePayload::Control(envelope) = frame.payload else {
                return Err(SessionError::Codec);
            };
            let request =
                BackfillRequest::try_from(&envelope).map_err(|_| SessionError::Codec)?;
            enqueue_backfill(state, reply, channel, request).await
        }
        other => {
            debug!(principal = %principal, frame_type = ?other, "unexpected client frame dropped");
            Ok(())
        }
    }
}

async fn enqueue_backfill(
    state: &Arc<ServerState>,
    reply: &mpsc::Sender<Frame>,
    channel: ChannelKind,
    request: BackfillRequest,
) -> Result<(), SessionError> {
    let limit = (request.limit as usize).clamp(1, MAX_BACKFILL_LIMIT);
    let events = state
        .event_log
        .events_after(&request.scope, request.after_sequence, limit)
        .await
        .map_err(|_| SessionError::Storage)?;
    let complete = events.len() < limit;
    let response = BackfillResponse {
        scope: request.scope,
        events: events.iter().map(|event| event.to_push()).collect(),
        complete,
    };
    let frame =
        Frame::control(channel, FrameType::BackfillResponse, &response).map_err(|_| SessionError::Codec)?;
    reply.try_send(frame).map_err(|_| SessionError::Transport)?;
    state.metrics.mark_backfill();
    Ok(())
}
