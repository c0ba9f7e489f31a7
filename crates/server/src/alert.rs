//! Operational alert path for outbox entries that exhausted their retries.
//!
//! The relay fires this exactly once per entry, at the moment the entry
//! leaves the poll set for good. The default implementation logs; real
//! deployments plug a pager or incident queue behind the same seam.

use tracing::error;
use volant_storage::OutboxEntry;

pub trait Alerter: Send + Sync {
    fn outbox_exhausted(&self, entry: &OutboxEntry);
}

pub struct LogAlerter;

impl Alerter for LogAlerter {
    fn outbox_exhausted(&self, entry: &OutboxEntry) {
        error!(
            event = %entry.event_id,
            kind = %entry.event_type,
            retries = entry.retry_count,
            last_error = entry.last_error.as_deref().unwrap_or("unknown"),
            "ALERT: outbox entry permanently failed"
        );
    }
}
