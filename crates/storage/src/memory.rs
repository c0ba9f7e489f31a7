//! In-memory storage adapter.
//!
//! Backs tests and single-node development with the same contracts as the
//! PostgreSQL storage, without external services.

use crate::{
    EventLog, OutboxEntry, OutboxStore, RecipientDirectory, StorageError, StoredEvent,
    OUTBOX_SCHEMA_VERSION,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use volant_proto::events::{EventKind, EventScope, ScopeKind};

#[derive(Default)]
struct MemoryInner {
    outbox: Vec<OutboxEntry>,
    exhausted: HashMap<String, DateTime<Utc>>,
    events: HashMap<String, Vec<StoredEvent>>,
    sequences: HashMap<String, u64>,
    groups: HashMap<String, Vec<String>>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counterpart of `Storage::publish_event`: allocates the scope
    /// sequence and appends the event-log row and outbox entry atomically
    /// under one lock.
    pub fn publish_event(
        &self,
        kind: EventKind,
        scope: &EventScope,
        payload: Value,
        actor_id: Option<&str>,
    ) -> Result<StoredEvent, StorageError> {
        let mut inner = self.inner.lock().expect("memory storage lock");
        inner.next_id += 1;
        let event_id = format!("mem-{:08}", inner.next_id);
        let sequence = {
            let counter = inner.sequences.entry(scope.key()).or_insert(0);
            *counter += 1;
            *counter
        };
        let stored = StoredEvent {
            event_id: event_id.clone(),
            kind,
            scope: scope.clone(),
            sequence,
            payload,
            occurred_at: Utc::now(),
        };
        let entry = OutboxEntry {
            event_id,
            event_type: kind,
            payload: serde_json::to_value(stored.to_push())
                .map_err(|_| StorageError::Serialization)?,
            schema_version: OUTBOX_SCHEMA_VERSION,
            subject_id: Some(scope.id.clone()),
            actor_id: actor_id.map(|id| id.to_string()),
            occurred_at: stored.occurred_at,
            processed_at: None,
            last_error: None,
            retry_count: 0,
            next_attempt_at: None,
        };
        inner
            .events
            .entry(scope.key())
            .or_default()
            .push(stored.clone());
        inner.outbox.push(entry);
        Ok(stored)
    }

    pub fn add_group_member(&self, group_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().expect("memory storage lock");
        let members = inner.groups.entry(group_id.to_string()).or_default();
        if !members.iter().any(|member| member == user_id) {
            members.push(user_id.to_string());
        }
    }

    pub fn remove_group_member(&self, group_id: &str, user_id: &str) {
        let mut inner = self.inner.lock().expect("memory storage lock");
        if let Some(members) = inner.groups.get_mut(group_id) {
            members.retain(|member| member != user_id);
        }
    }

    /// Test hook: the raw outbox row for an event id.
    pub fn outbox_entry(&self, event_id: &str) -> Option<OutboxEntry> {
        let inner = self.inner.lock().expect("memory storage lock");
        inner
            .outbox
            .iter()
            .find(|entry| entry.event_id == event_id)
            .cloned()
    }

    pub fn is_exhausted(&self, event_id: &str) -> bool {
        let inner = self.inner.lock().expect("memory storage lock");
        inner.exhausted.contains_key(event_id)
    }
}

#[async_trait]
impl OutboxStore for MemoryStorage {
    async fn poll_batch(&self, max: usize) -> Result<Vec<OutboxEntry>, StorageError> {
        let inner = self.inner.lock().expect("memory storage lock");
        let now = Utc::now();
        let mut batch: Vec<OutboxEntry> = inner
            .outbox
            .iter()
            .filter(|entry| {
                entry.processed_at.is_none()
                    && !inner.exhausted.contains_key(&entry.event_id)
                    && entry
                        .next_attempt_at
                        .map(|next| next <= now)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        batch.sort_by_key(|entry| entry.occurred_at);
        batch.truncate(max);
        Ok(batch)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("memory storage lock");
        let entry = inner
            .outbox
            .iter_mut()
            .find(|entry| entry.event_id == event_id)
            .ok_or(StorageError::Missing)?;
        if entry.processed_at.is_some() {
            return Ok(false);
        }
        entry.processed_at = Some(Utc::now());
        entry.last_error = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().expect("memory storage lock");
        if inner.exhausted.contains_key(event_id) {
            return Ok(false);
        }
        let entry = inner
            .outbox
            .iter_mut()
            .find(|entry| entry.event_id == event_id)
            .ok_or(StorageError::Missing)?;
        if entry.processed_at.is_some() {
            return Ok(false);
        }
        entry.last_error = Some(error.to_string());
        entry.retry_count += 1;
        entry.next_attempt_at = next_attempt_at;
        if next_attempt_at.is_none() {
            inner.exhausted.insert(event_id.to_string(), Utc::now());
        }
        Ok(true)
    }
}

#[async_trait]
impl EventLog for MemoryStorage {
    async fn events_after(
        &self,
        scope: &EventScope,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let inner = self.inner.lock().expect("memory storage lock");
        let mut events: Vec<StoredEvent> = inner
            .events
            .get(&scope.key())
            .map(|events| {
                events
                    .iter()
                    .filter(|event| event.sequence > after_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|event| event.sequence);
        events.truncate(limit);
        Ok(events)
    }
}

#[async_trait]
impl RecipientDirectory for MemoryStorage {
    async fn scope_recipients(&self, scope: &EventScope) -> Result<Vec<String>, StorageError> {
        match scope.kind {
            ScopeKind::Direct => Ok(vec![scope.id.clone()]),
            ScopeKind::Group => {
                let inner = self.inner.lock().expect("memory storage lock");
                Ok(inner.groups.get(&scope.id).cloned().unwrap_or_default())
            }
        }
    }
}
