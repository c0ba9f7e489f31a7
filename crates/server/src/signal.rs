//! Server-side call signaling: routes messages between the two parties of
//! a call and acknowledges invite delivery.
//!
//! The server keeps no media state; it only remembers which principals a
//! call id belongs to so answers, SDP, and ICE find their counterpart.
//! Messages for unknown call ids are dropped and logged, never turned into
//! channel errors.

use crate::metrics::Metrics;
use crate::router::ChannelRouter;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use volant_proto::signal::{
    CallReject, CallRejectReason, CallStateChanged, CallStateTag, SignalMessage,
};
use volant_proto::{ChannelKind, Frame, FrameType};

struct CallRoute {
    caller: String,
    callee: String,
    created_at: Instant,
}

pub struct SignalGateway {
    router: Arc<ChannelRouter>,
    metrics: Arc<Metrics>,
    routes: RwLock<HashMap<String, CallRoute>>,
    route_ttl: Duration,
}

impl SignalGateway {
    pub fn new(router: Arc<ChannelRouter>, metrics: Arc<Metrics>, route_ttl: Duration) -> Self {
        SignalGateway {
            router,
            metrics,
            routes: RwLock::new(HashMap::new()),
            route_ttl,
        }
    }

    /// Applies one signaling message from `from`. Invalid messages are
    /// dropped here; they never affect the carrying channel.
    pub fn handle(&self, from: &str, message: SignalMessage) {
        let call_id = message.call_id().to_string();
        if call_id.is_empty() {
            warn!(from = %from, label = message.label(), "signal without call id dropped");
            return;
        }
        match message {
            SignalMessage::Invite(invite) => {
                if invite.caller != from {
                    warn!(call = %call_id, from = %from, "invite with forged caller dropped");
                    return;
                }
                let callee = invite.callee.clone();
                {
                    let mut routes = self.routes.write().expect("signal routes lock");
                    if routes.contains_key(&call_id) {
                        warn!(call = %call_id, "duplicate invite dropped");
                        return;
                    }
                    routes.insert(
                        call_id.clone(),
                        CallRoute {
                            caller: from.to_string(),
                            callee: callee.clone(),
                            created_at: Instant::now(),
                        },
                    );
                }
                let delivered = self.forward(&callee, SignalMessage::Invite(invite));
                if delivered > 0 {
                    // Transport-level acknowledgement: the invite reached at
                    // least one of the callee's devices.
                    self.forward(
                        from,
                        SignalMessage::State(CallStateChanged {
                            call_id: call_id.clone(),
                            state: CallStateTag::Ringing,
                            reason: None,
                        }),
                    );
                } else {
                    self.routes
                        .write()
                        .expect("signal routes lock")
                        .remove(&call_id);
                    self.forward(
                        from,
                        SignalMessage::Reject(CallReject {
                            call_id: call_id.clone(),
                            reason: CallRejectReason::Unreachable,
                        }),
                    );
                }
            }
            SignalMessage::Reject(_) | SignalMessage::Hangup(_) => {
                if let Some(target) = self.counterpart(&call_id, from) {
                    self.forward(&target, message);
                    self.routes
                        .write()
                        .expect("signal routes lock")
                        .remove(&call_id);
                } else {
                    debug!(call = %call_id, from = %from, "terminal signal for unknown call dropped");
                }
            }
            other => {
                if let Some(target) = self.counterpart(&call_id, from) {
                    self.forward(&target, other);
                } else {
                    warn!(call = %call_id, from = %from, label = other.label(), "signal for unknown call dropped");
                }
            }
        }
    }

    /// Drops routes whose call never terminated cleanly. Returns how many
    /// were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut routes = self.routes.write().expect("signal routes lock");
        let before = routes.len();
        routes.retain(|_, route| route.created_at.elapsed() < self.route_ttl);
        before - routes.len()
    }

    pub fn active_calls(&self) -> usize {
        self.routes.read().expect("signal routes lock").len()
    }

    fn counterpart(&self, call_id: &str, from: &str) -> Option<String> {
        let routes = self.routes.read().expect("signal routes lock");
        let route = routes.get(call_id)?;
        if route.caller == from {
            Some(route.callee.clone())
        } else if route.callee == from {
            Some(route.caller.clone())
        } else {
            warn!(call = %call_id, from = %from, "signal from non-participant dropped");
            None
        }
    }

    fn forward(&self, target: &str, message: SignalMessage) -> usize {
        let frame = match Frame::control(ChannelKind::Signaling, FrameType::Signal, &message) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(target = %target, error = %error, "signal not encodable");
                return 0;
            }
        };
        let delivered = self.router.send_to(target, ChannelKind::Signaling, frame);
        if delivered > 0 {
            self.metrics.mark_signal_forwarded();
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use volant_proto::signal::{CallHangup, CallInvite, CallMedia, HangupReason, SdpExchange, SdpType};
    use volant_proto::FramePayload;

    fn gateway() -> (Arc<ChannelRouter>, SignalGateway) {
        let metrics = Arc::new(Metrics::new());
        let router = Arc::new(ChannelRouter::new(metrics.clone()));
        let gateway = SignalGateway::new(router.clone(), metrics, Duration::from_secs(120));
        (router, gateway)
    }

    fn register(router: &ChannelRouter, principal: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(8);
        router.register(principal, ChannelKind::Signaling, tx);
        rx
    }

    fn decode_signal(frame: Frame) -> SignalMessage {
        match frame.payload {
            FramePayload::Control(envelope) => {
                SignalMessage::try_from(&envelope).expect("decode signal")
            }
            _ => panic!("expected control payload"),
        }
    }

    fn invite(call_id: &str, caller: &str, callee: &str) -> SignalMessage {
        SignalMessage::Invite(CallInvite {
            call_id: call_id.to_string(),
            caller: caller.to_string(),
            callee: callee.to_string(),
            media: CallMedia::audio_only(),
            expires_at: None,
        })
    }

    #[tokio::test]
    async fn invite_reaches_callee_and_acks_ringing() {
        let (router, gateway) = gateway();
        let mut caller_rx = register(&router, "alice");
        let mut callee_rx = register(&router, "bob");

        gateway.handle("alice", invite("call-1", "alice", "bob"));

        match decode_signal(callee_rx.recv().await.unwrap()) {
            SignalMessage::Invite(msg) => assert_eq!(msg.caller, "alice"),
            other => panic!("unexpected: {:?}", other),
        }
        match decode_signal(caller_rx.recv().await.unwrap()) {
            SignalMessage::State(msg) => assert_eq!(msg.state, CallStateTag::Ringing),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(gateway.active_calls(), 1);
    }

    #[tokio::test]
    async fn invite_to_offline_callee_rejects_unreachable() {
        let (router, gateway) = gateway();
        let mut caller_rx = register(&router, "alice");

        gateway.handle("alice", invite("call-1", "alice", "bob"));

        match decode_signal(caller_rx.recv().await.unwrap()) {
            SignalMessage::Reject(msg) => {
                assert_eq!(msg.reason, CallRejectReason::Unreachable);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(gateway.active_calls(), 0);
    }

    #[tokio::test]
    async fn sdp_routes_to_counterpart_either_direction() {
        let (router, gateway) = gateway();
        let mut caller_rx = register(&router, "alice");
        let mut callee_rx = register(&router, "bob");

        gateway.handle("alice", invite("call-1", "alice", "bob"));
        callee_rx.recv().await.unwrap();
        caller_rx.recv().await.unwrap();

        gateway.handle(
            "alice",
            SignalMessage::Sdp(SdpExchange {
                call_id: "call-1".to_string(),
                sdp_type: SdpType::Offer,
                sdp: "v=0".to_string(),
            }),
        );
        match decode_signal(callee_rx.recv().await.unwrap()) {
            SignalMessage::Sdp(msg) => assert_eq!(msg.sdp_type, SdpType::Offer),
            other => panic!("unexpected: {:?}", other),
        }

        gateway.handle(
            "bob",
            SignalMessage::Sdp(SdpExchange {
                call_id: "call-1".to_string(),
                sdp_type: SdpType::Answer,
                sdp: "v=0".to_string(),
            }),
        );
        match decode_signal(caller_rx.recv().await.unwrap()) {
            SignalMessage::Sdp(msg) => assert_eq!(msg.sdp_type, SdpType::Answer),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn hangup_clears_route_and_later_signals_drop() {
        let (router, gateway) = gateway();
        let mut caller_rx = register(&router, "alice");
        let mut callee_rx = register(&router, "bob");

        gateway.handle("alice", invite("call-1", "alice", "bob"));
        callee_rx.recv().await.unwrap();
        caller_rx.recv().await.unwrap();

        gateway.handle(
            "alice",
            SignalMessage::Hangup(CallHangup {
                call_id: "call-1".to_string(),
                reason: HangupReason::Hangup,
            }),
        );
        match decode_signal(callee_rx.recv().await.unwrap()) {
            SignalMessage::Hangup(msg) => assert_eq!(msg.reason, HangupReason::Hangup),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(gateway.active_calls(), 0);

        // Late candidate for the finished call goes nowhere.
        gateway.handle(
            "bob",
            SignalMessage::Sdp(SdpExchange {
                call_id: "call-1".to_string(),
                sdp_type: SdpType::Answer,
                sdp: "v=0".to_string(),
            }),
        );
        assert!(caller_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_participant_cannot_inject_signals() {
        let (router, gateway) = gateway();
        let mut caller_rx = register(&router, "alice");
        let mut callee_rx = register(&router, "bob");
        let _eve_rx = register(&router, "eve");

        gateway.handle("alice", invite("call-1", "alice", "bob"));
        callee_rx.recv().await.unwrap();
        caller_rx.recv().await.unwrap();

        gateway.handle(
            "eve",
            SignalMessage::Hangup(CallHangup {
                call_id: "call-1".to_string(),
                reason: HangupReason::Hangup,
            }),
        );
        assert!(caller_rx.try_recv().is_err());
        assert!(callee_rx.try_recv().is_err());
        assert_eq!(gateway.active_calls(), 1);
    }

    #[tokio::test]
    async fn forged_caller_invite_is_dropped() {
        let (router, gateway) = gateway();
        let _caller_rx = register(&router, "alice");
        let mut callee_rx = register(&router, "bob");

        gateway.handle("eve", invite("call-1", "alice", "bob"));
        assert!(callee_rx.try_recv().is_err());
        assert_eq!(gateway.active_calls(), 0);
    }

    #[test]
    fn sweep_removes_stale_routes() {
        let metrics = Arc::new(Metrics::new());
        let router = Arc::new(ChannelRouter::new(metrics.clone()));
        let gateway = SignalGateway::new(router, metrics, Duration::from_millis(0));
        gateway
            .routes
            .write()
            .unwrap()
            .insert(
                "call-1".to_string(),
                CallRoute {
                    caller: "alice".to_string(),
                    callee: "bob".to_string(),
                    created_at: Instant::now() - Duration::from_secs(1),
                },
            );
        assert_eq!(gateway.sweep_expired(), 1);
        assert_eq!(gateway.active_calls(), 0);
    }
}
