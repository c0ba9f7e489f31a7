use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    relay_published: AtomicU64,
    relay_retried: AtomicU64,
    relay_exhausted: AtomicU64,
    deliveries_dropped: AtomicU64,
    backfill_served: AtomicU64,
    signals_forwarded: AtomicU64,
    handler_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::SeqCst)
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay_published(&self) {
        self.relay_published.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay_retried(&self) {
        self.relay_retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_relay_exhausted(&self) {
        self.relay_exhausted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn relay_exhausted(&self) -> u64 {
        self.relay_exhausted.load(Ordering::SeqCst)
    }

    pub fn mark_delivery_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn deliveries_dropped(&self) -> u64 {
        self.deliveries_dropped.load(Ordering::SeqCst)
    }

    pub fn mark_backfill(&self) {
        self.backfill_served.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_signal_forwarded(&self) {
        self.signals_forwarded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE volant_connections_active gauge\nvolant_connections_active {}\n\
             # TYPE volant_frames_ingress counter\nvolant_frames_ingress {}\n\
             # TYPE volant_frames_egress counter\nvolant_frames_egress {}\n\
             # TYPE volant_relay_published counter\nvolant_relay_published {}\n\
             # TYPE volant_relay_retried counter\nvolant_relay_retried {}\n\
             # TYPE volant_relay_exhausted counter\nvolant_relay_exhausted {}\n\
             # TYPE volant_deliveries_dropped counter\nvolant_deliveries_dropped {}\n\
             # TYPE volant_backfill_served counter\nvolant_backfill_served {}\n\
             # TYPE volant_signals_forwarded counter\nvolant_signals_forwarded {}\n\
             # TYPE volant_handler_failures counter\nvolant_handler_failures {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.relay_published.load(Ordering::SeqCst),
            self.relay_retried.load(Ordering::SeqCst),
            self.relay_exhausted.load(Ordering::SeqCst),
            self.deliveries_dropped.load(Ordering::SeqCst),
            self.backfill_served.load(Ordering::SeqCst),
            self.signals_forwarded.load(Ordering::SeqCst),
            self.handler_failures.load(Ordering::SeqCst),
        )
    }
}
