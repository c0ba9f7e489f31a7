use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Transaction};
use volant_proto::events::{EventKind, EventScope, PushEvent, ScopeKind};

pub mod memory;

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

pub const OUTBOX_SCHEMA_VERSION: i16 = 1;

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Serialization,
    Missing,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

/// One domain event awaiting publication. Created inside the business
/// transaction; afterwards only the relay touches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub event_id: String,
    pub event_type: EventKind,
    pub payload: Value,
    pub schema_version: i16,
    pub subject_id: Option<String>,
    pub actor_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// One event-log row. Sequences are allocated per scope in the same
/// transaction that writes the row, so they are strictly increasing and
/// never reused within a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub scope: EventScope,
    pub sequence: u64,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn to_push(&self) -> PushEvent {
        PushEvent {
            event_id: self.event_id.clone(),
            kind: self.kind,
            scope: self.scope.clone(),
            sequence: self.sequence,
            payload: self.payload.clone(),
            occurred_at: self.occurred_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: String,
    pub reader_id: String,
    pub read_at: DateTime<Utc>,
}

/// Relay-facing view of the outbox. Marking operations are idempotent:
/// repeating a mark beyond the first effective one reports `false`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Unprocessed entries whose backoff window has passed, oldest first.
    async fn poll_batch(&self, max: usize) -> Result<Vec<OutboxEntry>, StorageError>;

    async fn mark_processed(&self, event_id: &str) -> Result<bool, StorageError>;

    /// Records a failed publish attempt. `next_attempt_at` of `None` marks
    /// the entry permanently exhausted; it will not be polled again.
    async fn mark_failed(
        &self,
        event_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError>;
}

/// Backfill source: events of one scope strictly after a sequence.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn events_after(
        &self,
        scope: &EventScope,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError>;
}

/// Resolves an event scope to the principals that should observe it.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn scope_recipients(&self, scope: &EventScope) -> Result<Vec<String>, StorageError>;
}

pub struct Storage {
    client: Mutex<Client>,
    _pg_task: JoinHandle<()>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client: Mutex::new(client),
        _pg_task: task,
    })
}

/// Appends an outbox row inside the caller's transaction. The entry is
/// visible to the relay only if that transaction commits.
pub async fn append_outbox(
    txn: &Transaction<'_>,
    entry: &OutboxEntry,
) -> Result<(), StorageError> {
    txn.execute(
        "INSERT INTO event_outbox (event_id, event_type, payload, schema_version, subject_id, actor_id, occurred_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)",
        &[
            &entry.event_id,
            &entry.event_type.as_str(),
            &entry.payload,
            &entry.schema_version,
            &entry.subject_id,
            &entry.actor_id,
            &entry.occurred_at,
        ],
    )
    .await
    .map_err(|_| StorageError::Postgres)?;
    Ok(())
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Lightweight readiness probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Writes a domain event: allocates the scope sequence, appends the
    /// event-log row, and appends the outbox entry in one transaction.
    /// This is the `Append` operation callers embed business writes around.
    pub async fn publish_event(
        &self,
        kind: EventKind,
        scope: &EventScope,
        payload: Value,
        actor_id: Option<&str>,
    ) -> Result<StoredEvent, StorageError> {
        let mut client = self.client.lock().await;
        let txn = client
            .transaction()
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = txn
            .query_one(
                "INSERT INTO scope_sequence (scope_kind, scope_id, next_sequence) VALUES ($1, $2, 1)
                ON CONFLICT (scope_kind, scope_id)
                DO UPDATE SET next_sequence = scope_sequence.next_sequence + 1
                RETURNING next_sequence",
                &[&scope.kind.as_str(), &scope.id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let sequence: i64 = row.get(0);
        let occurred_at = Utc::now();
        let event_id = generate_event_id();
        txn.execute(
            "INSERT INTO event_log (event_id, scope_kind, scope_id, sequence, event_type, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &event_id,
                &scope.kind.as_str(),
                &scope.id,
                &sequence,
                &kind.as_str(),
                &payload,
                &occurred_at,
            ],
        )
        .await
        .map_err(|_| StorageError::Postgres)?;
        let stored = StoredEvent {
            event_id: event_id.clone(),
            kind,
            scope: scope.clone(),
            sequence: sequence as u64,
            payload,
            occurred_at,
        };
        let entry = OutboxEntry {
            event_id,
            event_type: kind,
            payload: serde_json::to_value(stored.to_push())
                .map_err(|_| StorageError::Serialization)?,
            schema_version: OUTBOX_SCHEMA_VERSION,
            subject_id: Some(scope.id.clone()),
            actor_id: actor_id.map(|id| id.to_string()),
            occurred_at,
            processed_at: None,
            last_error: None,
            retry_count: 0,
            next_attempt_at: None,
        };
        append_outbox(&txn, &entry).await?;
        txn.commit().await.map_err(|_| StorageError::Postgres)?;
        Ok(stored)
    }

    /// Records live delivery of a message.
    pub async fn mark_message_delivered(&self, message_id: &str) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO message_state (message_id, delivered_at) VALUES ($1, $2)
                ON CONFLICT (message_id) DO UPDATE SET delivered_at = COALESCE(message_state.delivered_at, excluded.delivered_at)",
                &[&message_id, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Flags a message as recalled. Repeated recalls keep the first stamp.
    pub async fn mark_message_recalled(&self, message_id: &str) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO message_state (message_id, recalled, recalled_at) VALUES ($1, TRUE, $2)
                ON CONFLICT (message_id) DO UPDATE SET
                    recalled = TRUE,
                    recalled_at = COALESCE(message_state.recalled_at, excluded.recalled_at)",
                &[&message_id, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Stores a read receipt; re-reading does not move the stamp.
    pub async fn record_read_receipt(
        &self,
        message_id: &str,
        reader_id: &str,
    ) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO read_receipt (message_id, reader_id, read_at) VALUES ($1, $2, $3)
                ON CONFLICT (message_id, reader_id) DO NOTHING",
                &[&message_id, &reader_id, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn read_receipts(&self, message_id: &str) -> Result<Vec<ReadReceipt>, StorageError> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                "SELECT message_id, reader_id, read_at FROM read_receipt WHERE message_id = $1 ORDER BY read_at",
                &[&message_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .iter()
            .map(|row| ReadReceipt {
                message_id: row.get(0),
                reader_id: row.get(1),
                read_at: row.get(2),
            })
            .collect())
    }

    pub async fn add_group_member(
        &self,
        group_id: &str,
        user_id: &str,
        role: &str,
    ) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "INSERT INTO group_member (group_id, user_id, role, joined_at) VALUES ($1, $2, $3, $4)
                ON CONFLICT (group_id, user_id) DO UPDATE SET role = excluded.role",
                &[&group_id, &user_id, &role, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn remove_group_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> Result<(), StorageError> {
        let client = self.client.lock().await;
        client
            .execute(
                "DELETE FROM group_member WHERE group_id = $1 AND user_id = $2",
                &[&group_id, &user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for Storage {
    async fn poll_batch(&self, max: usize) -> Result<Vec<OutboxEntry>, StorageError> {
        let client = self.client.lock().await;
        let limit = i64::try_from(max).map_err(|_| StorageError::Invalid)?;
        let rows = client
            .query(
                "SELECT event_id, event_type, payload, schema_version, subject_id, actor_id,
                        occurred_at, processed_at, last_error, retry_count, next_attempt_at
                FROM event_outbox
                WHERE processed_at IS NULL
                  AND exhausted_at IS NULL
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                ORDER BY occurred_at
                LIMIT $1",
                &[&limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.iter()
            .map(|row| {
                let event_type: String = row.get(1);
                Ok(OutboxEntry {
                    event_id: row.get(0),
                    event_type: EventKind::from_str(&event_type)
                        .map_err(|_| StorageError::Serialization)?,
                    payload: row.get(2),
                    schema_version: row.get(3),
                    subject_id: row.get(4),
                    actor_id: row.get(5),
                    occurred_at: row.get(6),
                    processed_at: row.get(7),
                    last_error: row.get(8),
                    retry_count: row.get(9),
                    next_attempt_at: row.get(10),
                })
            })
            .collect()
    }

    async fn mark_processed(&self, event_id: &str) -> Result<bool, StorageError> {
        let client = self.client.lock().await;
        let updated = client
            .execute(
                "UPDATE event_outbox SET processed_at = now(), last_error = NULL
                WHERE event_id = $1 AND processed_at IS NULL",
                &[&event_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(updated == 1)
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StorageError> {
        let client = self.client.lock().await;
        let updated = match next_attempt_at {
            Some(next) => client
                .execute(
                    "UPDATE event_outbox SET last_error = $2, retry_count = retry_count + 1, next_attempt_at = $3
                    WHERE event_id = $1 AND processed_at IS NULL AND exhausted_at IS NULL",
                    &[&event_id, &error, &next],
                )
                .await
                .map_err(|_| StorageError::Postgres)?,
            None => client
                .execute(
                    "UPDATE event_outbox SET last_error = $2, retry_count = retry_count + 1, exhausted_at = now()
                    WHERE event_id = $1 AND processed_at IS NULL AND exhausted_at IS NULL",
                    &[&event_id, &error],
                )
                .await
                .map_err(|_| StorageError::Postgres)?,
        };
        Ok(updated == 1)
    }
}

#[async_trait]
impl EventLog for Storage {
    async fn events_after(
        &self,
        scope: &EventScope,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let client = self.client.lock().await;
        let after = i64::try_from(after_sequence).map_err(|_| StorageError::Invalid)?;
        let limit = i64::try_from(limit).map_err(|_| StorageError::Invalid)?;
        let rows = client
            .query(
                "SELECT event_id, sequence, event_type, payload, occurred_at
                FROM event_log
                WHERE scope_kind = $1 AND scope_id = $2 AND sequence > $3
                ORDER BY sequence
                LIMIT $4",
                &[&scope.kind.as_str(), &scope.id, &after, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        rows.iter()
            .map(|row| {
                let event_type: String = row.get(2);
                let sequence: i64 = row.get(1);
                Ok(StoredEvent {
                    event_id: row.get(0),
                    kind: EventKind::from_str(&event_type)
                        .map_err(|_| StorageError::Serialization)?,
                    scope: scope.clone(),
                    sequence: sequence as u64,
                    payload: row.get(3),
                    occurred_at: row.get(4),
                })
            })
            .collect()
    }
}

#[async_trait]
impl RecipientDirectory for Storage {
    async fn scope_recipients(&self, scope: &EventScope) -> Result<Vec<String>, StorageError> {
        match scope.kind {
            ScopeKind::Direct => Ok(vec![scope.id.clone()]),
            ScopeKind::Group => {
                let client = self.client.lock().await;
                let rows = client
                    .query(
                        "SELECT user_id FROM group_member WHERE group_id = $1",
                        &[&scope.id],
                    )
                    .await
                    .map_err(|_| StorageError::Postgres)?;
                Ok(rows.iter().map(|row| row.get(0)).collect())
            }
        }
    }
}

fn generate_event_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sql_declares_core_relations() {
        assert!(INIT_SQL.contains("event_outbox"));
        assert!(INIT_SQL.contains("event_log"));
        assert!(INIT_SQL.contains("scope_sequence"));
        assert!(INIT_SQL.contains("read_receipt"));
        assert!(INIT_SQL.contains("group_member"));
    }

    #[test]
    fn event_id_format() {
        let id = generate_event_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_event_id());
    }

    #[test]
    fn stored_event_converts_to_push() {
        let stored = StoredEvent {
            event_id: "evt-1".to_string(),
            kind: EventKind::MessageReceived,
            scope: EventScope::direct("alice"),
            sequence: 7,
            payload: serde_json::json!({"body": "hi"}),
            occurred_at: Utc::now(),
        };
        let push = stored.to_push();
        assert_eq!(push.sequence, 7);
        assert_eq!(push.kind, EventKind::MessageReceived);
        assert_eq!(push.occurred_at, stored.occurred_at.timestamp_millis());
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let dsn = match std::env::var("VOLANT_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: VOLANT_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let storage = connect(&dsn).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let scope = EventScope::direct(format!("test-user-{}", suffix));

        let first = storage
            .publish_event(
                EventKind::MessageReceived,
                &scope,
                serde_json::json!({"body": "one"}),
                Some("peer"),
            )
            .await?;
        let second = storage
            .publish_event(
                EventKind::MessageReceived,
                &scope,
                serde_json::json!({"body": "two"}),
                Some("peer"),
            )
            .await?;
        assert!(second.sequence > first.sequence);

        let batch = storage.poll_batch(100).await?;
        assert!(batch.iter().any(|entry| entry.event_id == first.event_id));

        assert!(storage.mark_processed(&first.event_id).await?);
        assert!(!storage.mark_processed(&first.event_id).await?);

        assert!(
            storage
                .mark_failed(&second.event_id, "router unavailable", None)
                .await?
        );
        assert!(
            !storage
                .mark_failed(&second.event_id, "router unavailable", None)
                .await?
        );
        let remaining = storage.poll_batch(100).await?;
        assert!(
            !remaining
                .iter()
                .any(|entry| entry.event_id == second.event_id)
        );

        let tail = storage.events_after(&scope, first.sequence, 10).await?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_id, second.event_id);

        let group_id = format!("test-group-{}", suffix);
        storage.add_group_member(&group_id, "alice", "owner").await?;
        storage.add_group_member(&group_id, "bob", "member").await?;
        let recipients = storage
            .scope_recipients(&EventScope::group(group_id.clone()))
            .await?;
        assert_eq!(recipients.len(), 2);
        storage.remove_group_member(&group_id, "bob").await?;

        let message_id = format!("msg-{}", suffix);
        storage.mark_message_delivered(&message_id).await?;
        storage.mark_message_recalled(&message_id).await?;
        storage.record_read_receipt(&message_id, "bob").await?;
        storage.record_read_receipt(&message_id, "bob").await?;
        let receipts = storage.read_receipts(&message_id).await?;
        assert_eq!(receipts.len(), 1);
        Ok(())
    }
}
