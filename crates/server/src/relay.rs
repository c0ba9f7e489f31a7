//! Outbox relay: drains committed domain events into the channel router.
//!
//! The relay owns all mutation of outbox entries after their creation.
//! Publishing is at-least-once: an entry is marked processed only after the
//! sink accepted it, so a crash between publish and mark re-delivers on the
//! next poll. Consumers dedup by sequence number.

use crate::alert::Alerter;
use crate::config::RelaySettings;
use crate::metrics::Metrics;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use volant_proto::events::PushEvent;
use volant_storage::{OutboxEntry, OutboxStore, RecipientDirectory, StorageError};

#[derive(Debug)]
pub enum SinkError {
    Unavailable(String),
}

impl Display for SinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(detail) => write!(f, "sink unavailable: {}", detail),
        }
    }
}

impl Error for SinkError {}

/// Where published events go. The channel router is the production sink;
/// tests substitute failing ones to exercise the retry path.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &PushEvent, targets: &[String]) -> Result<usize, SinkError>;
}

pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    directory: Arc<dyn RecipientDirectory>,
    sink: Arc<dyn EventSink>,
    alerter: Arc<dyn Alerter>,
    metrics: Arc<Metrics>,
    settings: RelaySettings,
    notify: Arc<Notify>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        directory: Arc<dyn RecipientDirectory>,
        sink: Arc<dyn EventSink>,
        alerter: Arc<dyn Alerter>,
        metrics: Arc<Metrics>,
        settings: RelaySettings,
    ) -> Self {
        OutboxRelay {
            store,
            directory,
            sink,
            alerter,
            metrics,
            settings,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Handle for waking the relay immediately after an event commit,
    /// instead of waiting out the poll interval.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Runs until the shutdown channel yields. One batch per wakeup; the
    /// poll interval drives steady-state progress.
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) {
        info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            batch = self.settings.batch_size,
            max_retries = self.settings.max_retries,
            "outbox relay started"
        );
        let mut tick = interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown.recv() => {
                    info!("outbox relay shutting down");
                    return;
                }
            }
            if let Err(err) = self.process_batch().await {
                warn!(error = %err, "outbox poll failed");
            }
        }
    }

    /// Polls one batch and settles every entry. Returns how many entries
    /// were handled.
    pub async fn process_batch(&self) -> Result<usize, StorageError> {
        let batch = self.store.poll_batch(self.settings.batch_size).await?;
        let handled = batch.len();
        for entry in batch {
            self.process_entry(entry).await;
        }
        Ok(handled)
    }

    async fn process_entry(&self, entry: OutboxEntry) {
        let event: PushEvent = match serde_json::from_value(entry.payload.clone()) {
            Ok(event) => event,
            Err(err) => {
                // A payload that cannot decode will never publish; retrying
                // it is pure churn.
                self.exhaust(&entry, &format!("undecodable payload: {}", err))
                    .await;
                return;
            }
        };
        let targets = match self.directory.scope_recipients(&event.scope).await {
            Ok(targets) => targets,
            Err(err) => {
                self.settle_failure(&entry, &format!("recipient lookup failed: {}", err))
                    .await;
                return;
            }
        };
        match self.sink.publish(&event, &targets).await {
            Ok(delivered) => {
                match self.store.mark_processed(&entry.event_id).await {
                    Ok(true) => {
                        self.metrics.mark_relay_published();
                        debug!(
                            event = %entry.event_id,
                            kind = %entry.event_type,
                            targets = targets.len(),
                            delivered,
                            "outbox entry published"
                        );
                    }
                    Ok(false) => {
                        debug!(event = %entry.event_id, "outbox entry already settled");
                    }
                    Err(err) => {
                        // The publish happened; the unmarked entry will be
                        // re-polled and re-published. At-least-once, not
                        // exactly-once.
                        warn!(event = %entry.event_id, error = %err, "failed to mark entry processed");
                    }
                }
            }
            Err(err) => {
                self.settle_failure(&entry, &err.to_string()).await;
            }
        }
    }

    async fn settle_failure(&self, entry: &OutboxEntry, error: &str) {
        let attempts = entry.retry_count + 1;
        if attempts >= self.settings.max_retries as i32 {
            self.exhaust(entry, error).await;
            return;
        }
        let delay = self.backoff_delay(entry.retry_count);
        let next = Utc::now()
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(300));
        match self.store.mark_failed(&entry.event_id, error, Some(next)).await {
            Ok(true) => {
                self.metrics.mark_relay_retried();
                warn!(
                    event = %entry.event_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "publish failed, will retry"
                );
            }
            Ok(false) => {}
            Err(err) => {
                warn!(event = %entry.event_id, error = %err, "failed to record publish failure");
            }
        }
    }

    async fn exhaust(&self, entry: &OutboxEntry, error: &str) {
        match self.store.mark_failed(&entry.event_id, error, None).await {
            Ok(true) => {
                self.metrics.mark_relay_exhausted();
                error!(
                    event = %entry.event_id,
                    kind = %entry.event_type,
                    retries = entry.retry_count,
                    error = %error,
                    "outbox entry exhausted"
                );
                self.alerter.outbox_exhausted(entry);
            }
            Ok(false) => {
                debug!(event = %entry.event_id, "exhaustion already recorded");
            }
            Err(err) => {
                warn!(event = %entry.event_id, error = %err, "failed to record exhaustion");
            }
        }
    }

    /// Capped exponential backoff for the attempt after `retry_count`
    /// failures.
    fn backoff_delay(&self, retry_count: i32) -> Duration {
        let base = self.settings.backoff_base.as_secs_f64();
        let factor = self.settings.backoff_multiplier.powi(retry_count.max(0));
        let capped = (base * factor).min(self.settings.backoff_cap.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}
