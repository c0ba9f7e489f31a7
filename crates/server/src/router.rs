//! Server-side registry of live connections.
//!
//! Maps a principal to the delivery handles of its connections, sharded by
//! principal hash so register/unregister/publish on unrelated principals
//! never contend on one lock. The router holds non-owning handles only:
//! session tasks own their connections and unregister on the way out.

use crate::metrics::Metrics;
use crate::relay::{EventSink, SinkError};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use volant_proto::events::PushEvent;
use volant_proto::{ChannelKind, ControlEnvelope, Frame, FramePayload, FrameType};

const SHARD_COUNT: usize = 16;

struct RouteHandle {
    connection_id: u64,
    channel: ChannelKind,
    sender: mpsc::Sender<Frame>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct ChannelRouter {
    shards: Vec<RwLock<HashMap<String, Vec<RouteHandle>>>>,
    next_connection_id: AtomicU64,
    metrics: Arc<Metrics>,
}

impl ChannelRouter {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        ChannelRouter {
            shards,
            next_connection_id: AtomicU64::new(1),
            metrics,
        }
    }

    fn shard(&self, principal_id: &str) -> &RwLock<HashMap<String, Vec<RouteHandle>>> {
        let mut hasher = DefaultHasher::new();
        principal_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Registers a live connection and returns its connection id.
    pub fn register(
        &self,
        principal_id: &str,
        channel: ChannelKind,
        sender: mpsc::Sender<Frame>,
    ) -> u64 {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let mut shard = self.shard(principal_id).write().expect("router shard lock");
        shard
            .entry(principal_id.to_string())
            .or_default()
            .push(RouteHandle {
                connection_id,
                channel,
                sender,
            });
        debug!(principal = %principal_id, channel = %channel, connection = connection_id, "route registered");
        connection_id
    }

    pub fn unregister(&self, principal_id: &str, connection_id: u64) {
        let mut shard = self.shard(principal_id).write().expect("router shard lock");
        if let Some(handles) = shard.get_mut(principal_id) {
            handles.retain(|handle| handle.connection_id != connection_id);
            if handles.is_empty() {
                shard.remove(principal_id);
            }
        }
        debug!(principal = %principal_id, connection = connection_id, "route unregistered");
    }

    pub fn connection_count(&self, principal_id: &str, channel: ChannelKind) -> usize {
        let shard = self.shard(principal_id).read().expect("router shard lock");
        shard
            .get(principal_id)
            .map(|handles| {
                handles
                    .iter()
                    .filter(|handle| handle.channel == channel)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Best-effort fan-out of one event to every live connection of the
    /// targets on the event's channel. Slow or closed connections shed the
    /// frame; the sequence/backfill path recovers for them.
    pub fn publish_event(&self, event: &PushEvent, targets: &[String]) -> PublishOutcome {
        let channel = event.kind.channel();
        let envelope = match ControlEnvelope::try_from(event) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(event = %event.event_id, error = %error, "event not encodable, skipping fan-out");
                return PublishOutcome::default();
            }
        };
        let frame = Frame {
            channel,
            sequence: event.sequence,
            frame_type: FrameType::Event,
            payload: FramePayload::Control(envelope),
        };
        let mut outcome = PublishOutcome::default();
        for target in targets {
            let senders = self.snapshot(target, channel);
            for sender in senders {
                if self.dispatch(&sender, frame.clone(), target) {
                    outcome.delivered += 1;
                } else {
                    outcome.dropped += 1;
                }
            }
        }
        outcome
    }

    /// Sends one frame to every live connection of a principal on a
    /// channel. Used by signaling forwarding and handshake follow-ups.
    pub fn send_to(&self, principal_id: &str, channel: ChannelKind, frame: Frame) -> usize {
        let senders = self.snapshot(principal_id, channel);
        let mut delivered = 0;
        for sender in senders {
            if self.dispatch(&sender, frame.clone(), principal_id) {
                delivered += 1;
            }
        }
        delivered
    }

    fn snapshot(&self, principal_id: &str, channel: ChannelKind) -> Vec<mpsc::Sender<Frame>> {
        let shard = self.shard(principal_id).read().expect("router shard lock");
        shard
            .get(principal_id)
            .map(|handles| {
                handles
                    .iter()
                    .filter(|handle| handle.channel == channel)
                    .map(|handle| handle.sender.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn dispatch(&self, sender: &mpsc::Sender<Frame>, frame: Frame, target: &str) -> bool {
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(error) => {
                self.metrics.mark_delivery_dropped();
                warn!(target = %target, error = %error, "delivery queue rejected frame");
                false
            }
        }
    }
}

#[async_trait]
impl EventSink for ChannelRouter {
    async fn publish(&self, event: &PushEvent, targets: &[String]) -> Result<usize, SinkError> {
        Ok(self.publish_event(event, targets).delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volant_proto::events::{EventKind, EventScope};

    fn event(kind: EventKind, sequence: u64) -> PushEvent {
        PushEvent {
            event_id: format!("evt-{}", sequence),
            kind,
            scope: EventScope::direct("alice"),
            sequence,
            payload: serde_json::json!({}),
            occurred_at: 0,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_all_devices_of_target() {
        let router = ChannelRouter::new(Arc::new(Metrics::new()));
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_other, mut rx_other) = mpsc::channel(4);
        router.register("alice", ChannelKind::Messaging, tx_a);
        router.register("alice", ChannelKind::Messaging, tx_b);
        router.register("bob", ChannelKind::Messaging, tx_other);

        let outcome = router.publish_event(
            &event(EventKind::MessageReceived, 5),
            &["alice".to_string()],
        );
        assert_eq!(outcome.delivered, 2);
        assert_eq!(outcome.dropped, 0);
        assert_eq!(rx_a.recv().await.unwrap().sequence, 5);
        assert_eq!(rx_b.recv().await.unwrap().sequence, 5);
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_only_reach_matching_channel() {
        let router = ChannelRouter::new(Arc::new(Metrics::new()));
        let (tx_msg, mut rx_msg) = mpsc::channel(4);
        let (tx_presence, mut rx_presence) = mpsc::channel(4);
        router.register("alice", ChannelKind::Messaging, tx_msg);
        router.register("alice", ChannelKind::Presence, tx_presence);

        router.publish_event(&event(EventKind::PresenceChanged, 1), &["alice".to_string()]);
        assert!(rx_msg.try_recv().is_err());
        let frame = rx_presence.recv().await.unwrap();
        assert_eq!(frame.channel, ChannelKind::Presence);

        router.publish_event(&event(EventKind::MessageReceived, 2), &["alice".to_string()]);
        assert!(rx_presence.try_recv().is_err());
        assert_eq!(rx_msg.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let router = ChannelRouter::new(Arc::new(Metrics::new()));
        let (tx, mut rx) = mpsc::channel(4);
        let id = router.register("alice", ChannelKind::Messaging, tx);
        assert_eq!(router.connection_count("alice", ChannelKind::Messaging), 1);
        router.unregister("alice", id);
        assert_eq!(router.connection_count("alice", ChannelKind::Messaging), 0);

        let outcome = router.publish_event(
            &event(EventKind::MessageReceived, 1),
            &["alice".to_string()],
        );
        assert_eq!(outcome.delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_sheds_instead_of_blocking() {
        let metrics = Arc::new(Metrics::new());
        let router = ChannelRouter::new(metrics.clone());
        let (tx, _rx) = mpsc::channel(1);
        router.register("alice", ChannelKind::Messaging, tx);

        let first = router.publish_event(
            &event(EventKind::MessageReceived, 1),
            &["alice".to_string()],
        );
        assert_eq!(first.delivered, 1);
        let second = router.publish_event(
            &event(EventKind::MessageReceived, 2),
            &["alice".to_string()],
        );
        assert_eq!(second.delivered, 0);
        assert_eq!(second.dropped, 1);
        assert_eq!(metrics.deliveries_dropped(), 1);
    }

    #[tokio::test]
    async fn publishing_to_absent_target_is_not_an_error() {
        let router = ChannelRouter::new(Arc::new(Metrics::new()));
        let outcome = router.publish_event(
            &event(EventKind::MessageReceived, 1),
            &["nobody".to_string()],
        );
        assert_eq!(outcome, PublishOutcome::default());
    }
}
