//! Postgres-backed event store.
//!
//! Append-only semantics are enforced at the database level: the
//! events table only ever sees INSERT, `event_id` is the primary key,
//! and per-tenant appends serialize on an advisory transaction lock
//! keyed by `business_id`, so the chain tip is a deterministic
//! function of prior events.
//!
//! ## Error mapping
//!
//! | sqlx error | EventStoreError |
//! |------------|-----------------|
//! | unique violation (`23505`) | `IdempotencyConflict` |
//! | other database errors | `Unavailable` |
//! | pool closed / network | `Unavailable` |

use std::future::Future;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::instrument;

use bos_core::{ActorType, BusinessId, Clock, EventId};
use bos_events::{EventRecord, EventStatus, EventTypeRegistry, Reference, GENESIS_HASH};

use super::r#trait::{ChainedEvent, EventStore, EventStoreError, ReadQuery};
use crate::replay_gate::ReplayGate;

/// DDL for the events table. Ship this through the deployment's
/// migration tooling; `ensure_schema` applies it for dev setups.
pub const EVENTS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS bos_events (
    event_id            UUID PRIMARY KEY,
    event_type          TEXT NOT NULL,
    event_version       INT NOT NULL,
    business_id         UUID NOT NULL,
    branch_id           UUID,
    source_engine       TEXT NOT NULL,
    actor_type          TEXT NOT NULL,
    actor_id            TEXT NOT NULL,
    correlation_id      UUID NOT NULL,
    causation_id        UUID,
    payload             JSONB NOT NULL,
    reference           JSONB,
    created_at          TIMESTAMPTZ NOT NULL,
    received_at         TIMESTAMPTZ NOT NULL,
    status              TEXT NOT NULL,
    correction_of       UUID,
    previous_event_hash TEXT NOT NULL,
    event_hash          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bos_events_business_order
    ON bos_events (business_id, received_at, event_id);
CREATE INDEX IF NOT EXISTS idx_bos_events_type
    ON bos_events (event_type);
CREATE INDEX IF NOT EXISTS idx_bos_events_correlation
    ON bos_events (correlation_id);
"#;

/// Durable, hash-chained event store on PostgreSQL.
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    registry: Arc<EventTypeRegistry>,
    clock: Arc<dyn Clock>,
    replay_gate: Arc<ReplayGate>,
    fallback_runtime: OnceLock<tokio::runtime::Runtime>,
}

impl PostgresEventStore {
    pub fn new(
        pool: PgPool,
        registry: Arc<EventTypeRegistry>,
        clock: Arc<dyn Clock>,
        replay_gate: Arc<ReplayGate>,
    ) -> Self {
        Self {
            pool: Arc::new(pool),
            registry,
            clock,
            replay_gate,
            fallback_runtime: OnceLock::new(),
        }
    }

    /// Apply the events DDL (development convenience).
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        sqlx::raw_sql(EVENTS_TABLE_DDL)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, events), fields(business_id = %business_id, count = events.len()), err)]
    pub async fn append_async(
        &self,
        business_id: BusinessId,
        events: Vec<ChainedEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        if self.replay_gate.is_active() {
            return Err(EventStoreError::ReplayIsolation);
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        for event in &events {
            let candidate = &event.candidate;
            if candidate.business_id != business_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "event {} targets a different business",
                    candidate.event_id
                )));
            }
            if !self.registry.is_registered(&candidate.event_type) {
                return Err(EventStoreError::UnknownEventType(
                    candidate.event_type.clone(),
                ));
            }
            let computed = candidate
                .chain_hash(&event.previous_event_hash)
                .map_err(|e| EventStoreError::HashMismatch {
                    event_id: candidate.event_id,
                    message: e.to_string(),
                })?;
            if computed != event.event_hash {
                return Err(EventStoreError::HashMismatch {
                    event_id: candidate.event_id,
                    message: "event_hash does not match canonical recomputation".to_string(),
                });
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Per-tenant write serialization for the whole transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(business_id.as_uuid().to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        // Idempotency: identical resubmission returns stored records.
        let ids: Vec<uuid::Uuid> = events
            .iter()
            .map(|e| *e.candidate.event_id.as_uuid())
            .collect();
        let existing = sqlx::query(
            "SELECT event_id, event_hash FROM bos_events WHERE event_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("idempotency_check", e))?;

        if existing.len() == events.len() {
            for event in &events {
                let row = existing
                    .iter()
                    .find(|row| {
                        row.try_get::<uuid::Uuid, _>("event_id").ok()
                            == Some(*event.candidate.event_id.as_uuid())
                    })
                    .ok_or_else(|| {
                        EventStoreError::IdempotencyConflict(event.candidate.event_id)
                    })?;
                let stored_hash: String = row
                    .try_get("event_hash")
                    .map_err(|e| map_sqlx_error("idempotency_check", e))?;
                if stored_hash != event.event_hash {
                    return Err(EventStoreError::IdempotencyConflict(
                        event.candidate.event_id,
                    ));
                }
            }
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            let mut stored = Vec::with_capacity(ids.len());
            for (event, id) in events.iter().zip(ids) {
                let record = self
                    .get_async(business_id, EventId::from_uuid(id))
                    .await?
                    .ok_or_else(|| {
                        EventStoreError::IdempotencyConflict(event.candidate.event_id)
                    })?;
                stored.push(record);
            }
            return Ok(stored);
        }
        if !existing.is_empty() {
            let first: uuid::Uuid = existing[0]
                .try_get("event_id")
                .map_err(|e| map_sqlx_error("idempotency_check", e))?;
            return Err(EventStoreError::IdempotencyConflict(EventId::from_uuid(
                first,
            )));
        }

        // Chain continuity against the stored tip.
        let tip_row = sqlx::query(
            r#"
            SELECT event_hash, received_at
            FROM bos_events
            WHERE business_id = $1
            ORDER BY received_at DESC, event_id DESC
            LIMIT 1
            "#,
        )
        .bind(business_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("chain_tip", e))?;

        let (tip_hash, tip_received_at) = match &tip_row {
            Some(row) => (
                row.try_get::<String, _>("event_hash")
                    .map_err(|e| map_sqlx_error("chain_tip", e))?,
                Some(
                    row.try_get::<DateTime<Utc>, _>("received_at")
                        .map_err(|e| map_sqlx_error("chain_tip", e))?,
                ),
            ),
            None => (GENESIS_HASH.to_string(), None),
        };

        let mut expected = tip_hash;
        for event in &events {
            if event.previous_event_hash != expected {
                return Err(EventStoreError::ChainMismatch {
                    expected,
                    found: event.previous_event_hash.clone(),
                });
            }
            expected = event.event_hash.clone();
        }

        // Commit: strictly increasing received_at per business.
        let now = self.clock.now_utc();
        let mut last_received = tip_received_at;
        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            let received_at = match last_received {
                Some(last) if last >= now => last + Duration::microseconds(1),
                _ => now,
            };
            last_received = Some(received_at);

            let record = event.candidate.into_record(
                received_at,
                event.previous_event_hash,
                event.event_hash,
            );
            insert_event(&mut tx, &record).await?;
            committed.push(record);
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        tracing::debug!(count = committed.len(), "events appended");
        Ok(committed)
    }

    #[instrument(skip(self), fields(business_id = %business_id), err)]
    pub async fn chain_tip_async(
        &self,
        business_id: BusinessId,
    ) -> Result<Option<String>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_hash
            FROM bos_events
            WHERE business_id = $1
            ORDER BY received_at DESC, event_id DESC
            LIMIT 1
            "#,
        )
        .bind(business_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("chain_tip", e))?;

        row.map(|r| {
            r.try_get::<String, _>("event_hash")
                .map_err(|e| map_sqlx_error("chain_tip", e))
        })
        .transpose()
    }

    pub async fn read_async(
        &self,
        business_id: BusinessId,
        query: &ReadQuery,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let (after_received, after_id) = match query.after {
            Some(cursor) => (
                Some(cursor.received_at),
                Some(*cursor.event_id.as_uuid()),
            ),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT event_id, event_type, event_version, business_id, branch_id,
                   source_engine, actor_type, actor_id, correlation_id,
                   causation_id, payload, reference, created_at, received_at,
                   status, correction_of, previous_event_hash, event_hash
            FROM bos_events
            WHERE business_id = $1
              AND ($2::timestamptz IS NULL OR received_at >= $2)
              AND ($3::timestamptz IS NULL OR received_at <= $3)
              AND (
                    $4::timestamptz IS NULL
                    OR received_at > $4
                    OR (received_at = $4 AND event_id > $5)
              )
              AND (cardinality($6::text[]) = 0 OR event_type = ANY($6))
            ORDER BY received_at ASC, event_id ASC
            LIMIT $7
            "#,
        )
        .bind(business_id.as_uuid())
        .bind(query.since)
        .bind(query.until)
        .bind(after_received)
        .bind(after_id)
        .bind(&query.event_types)
        .bind(query.limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read", e))?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn get_async(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT event_id, event_type, event_version, business_id, branch_id,
                   source_engine, actor_type, actor_id, correlation_id,
                   causation_id, payload, reference, created_at, received_at,
                   status, correction_of, previous_event_hash, event_hash
            FROM bos_events
            WHERE business_id = $1 AND event_id = $2
            "#,
        )
        .bind(business_id.as_uuid())
        .bind(event_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn verify_chain_async(
        &self,
        business_id: BusinessId,
    ) -> Result<usize, EventStoreError> {
        let records = self.read_async(business_id, &ReadQuery::default()).await?;
        let mut expected = GENESIS_HASH.to_string();
        for record in &records {
            if record.previous_event_hash != expected {
                return Err(EventStoreError::ChainMismatch {
                    expected,
                    found: record.previous_event_hash.clone(),
                });
            }
            record
                .verify_hash()
                .map_err(|e| EventStoreError::HashMismatch {
                    event_id: record.event_id,
                    message: e.to_string(),
                })?;
            expected = record.event_hash.clone();
        }
        Ok(records.len())
    }

    /// Drive an async store call from synchronous kernel code.
    fn run_blocking<T>(
        &self,
        fut: impl Future<Output = Result<T, EventStoreError>>,
    ) -> Result<T, EventStoreError> {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            return tokio::task::block_in_place(|| handle.block_on(fut));
        }
        let runtime = self.fallback_runtime.get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .expect("failed to build event store runtime")
        });
        runtime.block_on(fut)
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        business_id: BusinessId,
        events: Vec<ChainedEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.run_blocking(self.append_async(business_id, events))
    }

    fn chain_tip(&self, business_id: BusinessId) -> Result<Option<String>, EventStoreError> {
        self.run_blocking(self.chain_tip_async(business_id))
    }

    fn read(
        &self,
        business_id: BusinessId,
        query: &ReadQuery,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        self.run_blocking(self.read_async(business_id, query))
    }

    fn get_by_event_id(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        self.run_blocking(self.get_async(business_id, event_id))
    }

    fn verify_chain(&self, business_id: BusinessId) -> Result<usize, EventStoreError> {
        self.run_blocking(self.verify_chain_async(business_id))
    }

    fn businesses(&self) -> Result<Vec<BusinessId>, EventStoreError> {
        self.run_blocking(async {
            let rows = sqlx::query(
                "SELECT DISTINCT business_id FROM bos_events ORDER BY business_id",
            )
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("businesses", e))?;

            rows.iter()
                .map(|row| {
                    row.try_get::<uuid::Uuid, _>("business_id")
                        .map(BusinessId::from_uuid)
                        .map_err(|e| map_sqlx_error("businesses", e))
                })
                .collect()
        })
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    record: &EventRecord,
) -> Result<(), EventStoreError> {
    let reference = record
        .reference
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| EventStoreError::Unavailable(format!("reference encoding failed: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO bos_events (
            event_id, event_type, event_version, business_id, branch_id,
            source_engine, actor_type, actor_id, correlation_id,
            causation_id, payload, reference, created_at, received_at,
            status, correction_of, previous_event_hash, event_hash
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18
        )
        "#,
    )
    .bind(record.event_id.as_uuid())
    .bind(&record.event_type)
    .bind(record.event_version as i32)
    .bind(record.business_id.as_uuid())
    .bind(record.branch_id.map(|b| *b.as_uuid()))
    .bind(&record.source_engine)
    .bind(record.actor_type.as_str())
    .bind(&record.actor_id)
    .bind(record.correlation_id.as_uuid())
    .bind(record.causation_id.map(|c| *c.as_uuid()))
    .bind(&record.payload)
    .bind(reference)
    .bind(record.created_at)
    .bind(record.received_at)
    .bind(record.status.as_str())
    .bind(record.correction_of.map(|c| *c.as_uuid()))
    .bind(&record.previous_event_hash)
    .bind(&record.event_hash)
    .execute(&mut **tx)
    .await
    .map_err(|e| match unique_violation(&e) {
        true => EventStoreError::IdempotencyConflict(record.event_id),
        false => map_sqlx_error("insert", e),
    })?;

    Ok(())
}

fn unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    tracing::error!(operation, error = %err, "event store backend error");
    EventStoreError::Unavailable(format!("{operation}: {err}"))
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<EventRecord, EventStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode", e);

    let actor_type_raw: String = row.try_get("actor_type").map_err(decode)?;
    let actor_type = match actor_type_raw.as_str() {
        "HUMAN" => ActorType::Human,
        "SYSTEM" => ActorType::System,
        "DEVICE" => ActorType::Device,
        "AI" => ActorType::Ai,
        other => {
            return Err(EventStoreError::Unavailable(format!(
                "stored actor_type '{other}' is not valid"
            )))
        }
    };

    let status_raw: String = row.try_get("status").map_err(decode)?;
    let status = match status_raw.as_str() {
        "FINAL" => EventStatus::Final,
        "PROVISIONAL" => EventStatus::Provisional,
        "REVIEW_REQUIRED" => EventStatus::ReviewRequired,
        other => {
            return Err(EventStoreError::Unavailable(format!(
                "stored status '{other}' is not valid"
            )))
        }
    };

    let reference: Option<serde_json::Value> = row.try_get("reference").map_err(decode)?;
    let reference = reference
        .map(serde_json::from_value::<Reference>)
        .transpose()
        .map_err(|e| EventStoreError::Unavailable(format!("reference decoding failed: {e}")))?;

    Ok(EventRecord {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(decode)?),
        event_type: row.try_get("event_type").map_err(decode)?,
        event_version: row.try_get::<i32, _>("event_version").map_err(decode)? as u32,
        business_id: BusinessId::from_uuid(row.try_get("business_id").map_err(decode)?),
        branch_id: row
            .try_get::<Option<uuid::Uuid>, _>("branch_id")
            .map_err(decode)?
            .map(bos_core::BranchId::from_uuid),
        source_engine: row.try_get("source_engine").map_err(decode)?,
        actor_type,
        actor_id: row.try_get("actor_id").map_err(decode)?,
        correlation_id: bos_core::CorrelationId::from_uuid(
            row.try_get("correlation_id").map_err(decode)?,
        ),
        causation_id: row
            .try_get::<Option<uuid::Uuid>, _>("causation_id")
            .map_err(decode)?
            .map(EventId::from_uuid),
        payload: row.try_get("payload").map_err(decode)?,
        reference,
        created_at: row.try_get("created_at").map_err(decode)?,
        received_at: row.try_get("received_at").map_err(decode)?,
        status,
        correction_of: row
            .try_get::<Option<uuid::Uuid>, _>("correction_of")
            .map_err(decode)?
            .map(EventId::from_uuid),
        previous_event_hash: row.try_get("previous_event_hash").map_err(decode)?,
        event_hash: row.try_get("event_hash").map_err(decode)?,
    })
}
