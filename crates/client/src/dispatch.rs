//! Event dispatch: one handler table keyed by event kind.
//!
//! Push delivery is at-least-once, so the dispatcher dedups by per-scope
//! sequence before invoking handlers. A sequence jump is surfaced on the
//! gap callback for the application to backfill; handler failures are
//! logged and counted, never propagated into the channel pump.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};
use volant_proto::events::{EventKind, EventScope, PushEvent};

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
}

pub type EventHandler = Box<dyn Fn(&PushEvent) -> Result<(), HandlerError> + Send + Sync>;
pub type GapObserver = Box<dyn Fn(&EventScope, u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Applied,
    Duplicate,
    Unhandled,
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventKind, EventHandler>>,
    last_applied: Mutex<HashMap<String, u64>>,
    gap_observer: RwLock<Option<GapObserver>>,
    handler_failures: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the handler for one event kind, replacing any previous one.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&PushEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("handler table lock")
            .insert(kind, Box::new(handler));
    }

    /// Called when an arriving sequence skips past the last applied one;
    /// `expected` is the first missing sequence.
    pub fn on_gap<F>(&self, observer: F)
    where
        F: Fn(&EventScope, u64, u64) + Send + Sync + 'static,
    {
        *self.gap_observer.write().expect("gap observer lock") = Some(Box::new(observer));
    }

    /// Highest sequence applied for a scope, zero if none.
    pub fn last_applied(&self, scope: &EventScope) -> u64 {
        self.last_applied
            .lock()
            .expect("sequence map lock")
            .get(&scope.key())
            .copied()
            .unwrap_or(0)
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::SeqCst)
    }

    pub fn dispatch(&self, event: &PushEvent) -> DispatchResult {
        if event.sequence > 0 {
            let mut last = self.last_applied.lock().expect("sequence map lock");
            let applied = last.entry(event.scope.key()).or_insert(0);
            if event.sequence <= *applied {
                debug!(
                    event = %event.event_id,
                    scope = %event.scope,
                    sequence = event.sequence,
                    "duplicate event dropped"
                );
                return DispatchResult::Duplicate;
            }
            if event.sequence > *applied + 1 {
                let expected = *applied + 1;
                if let Some(observer) = self.gap_observer.read().expect("gap observer lock").as_ref()
                {
                    observer(&event.scope, expected, event.sequence);
                }
            }
            *applied = event.sequence;
        }
        let handlers = self.handlers.read().expect("handler table lock");
        let Some(handler) = handlers.get(&event.kind) else {
            debug!(kind = %event.kind, "no handler registered");
            return DispatchResult::Unhandled;
        };
        if let Err(error) = handler(event) {
            self.handler_failures.fetch_add(1, Ordering::SeqCst);
            warn!(
                event = %event.event_id,
                kind = %event.kind,
                error = %error,
                "event handler failed"
            );
        }
        DispatchResult::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn event(sequence: u64) -> PushEvent {
        PushEvent {
            event_id: format!("evt-{}", sequence),
            kind: EventKind::MessageReceived,
            scope: EventScope::direct("alice"),
            sequence,
            payload: serde_json::json!({}),
            occurred_at: 0,
        }
    }

    #[test]
    fn duplicates_do_not_reapply() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dispatcher.on(EventKind::MessageReceived, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(dispatcher.dispatch(&event(1)), DispatchResult::Applied);
        assert_eq!(dispatcher.dispatch(&event(1)), DispatchResult::Duplicate);
        assert_eq!(dispatcher.dispatch(&event(2)), DispatchResult::Applied);
        assert_eq!(dispatcher.dispatch(&event(2)), DispatchResult::Duplicate);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.last_applied(&EventScope::direct("alice")), 2);
    }

    #[test]
    fn scopes_track_sequences_independently() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on(EventKind::MessageReceived, |_| Ok(()));
        let mut group_event = event(1);
        group_event.scope = EventScope::group("grp-1");
        assert_eq!(dispatcher.dispatch(&event(1)), DispatchResult::Applied);
        assert_eq!(dispatcher.dispatch(&group_event), DispatchResult::Applied);
        assert_eq!(dispatcher.last_applied(&EventScope::direct("alice")), 1);
        assert_eq!(dispatcher.last_applied(&EventScope::group("grp-1")), 1);
    }

    #[test]
    fn gap_observer_sees_the_missing_range() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on(EventKind::MessageReceived, |_| Ok(()));
        let gaps = Arc::new(Mutex::new(Vec::new()));
        let sink = gaps.clone();
        dispatcher.on_gap(move |scope, expected, got| {
            sink.lock().unwrap().push((scope.key(), expected, got));
        });

        dispatcher.dispatch(&event(1));
        dispatcher.dispatch(&event(2));
        dispatcher.dispatch(&event(7));
        let observed = gaps.lock().unwrap().clone();
        assert_eq!(observed, vec![("direct:alice".to_string(), 3, 7)]);
    }

    #[test]
    fn handler_errors_are_counted_not_propagated() {
        let dispatcher = EventDispatcher::new();
        dispatcher.on(EventKind::MessageReceived, |event| {
            if event.sequence == 2 {
                Err(HandlerError::Failed("boom".to_string()))
            } else {
                Ok(())
            }
        });

        assert_eq!(dispatcher.dispatch(&event(1)), DispatchResult::Applied);
        assert_eq!(dispatcher.dispatch(&event(2)), DispatchResult::Applied);
        assert_eq!(dispatcher.dispatch(&event(3)), DispatchResult::Applied);
        assert_eq!(dispatcher.handler_failures(), 1);
    }

    #[test]
    fn backfilled_events_apply_in_order_exactly_once() {
        let dispatcher = EventDispatcher::new();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        dispatcher.on(EventKind::MessageReceived, move |event| {
            sink.lock().unwrap().push(event.sequence);
            Ok(())
        });

        for sequence in 1..=10 {
            dispatcher.dispatch(&event(sequence));
        }
        // Offline window: 11..=13 arrive via backfill, 12 also raced in as
        // a live push afterwards.
        for sequence in [11, 12, 13, 12] {
            dispatcher.dispatch(&event(sequence));
        }
        let seen = applied.lock().unwrap().clone();
        assert_eq!(seen, (1..=13).collect::<Vec<u64>>());
    }

    #[test]
    fn unhandled_kinds_are_reported() {
        let dispatcher = EventDispatcher::new();
        assert_eq!(dispatcher.dispatch(&event(1)), DispatchResult::Unhandled);
    }
}
