//! In-memory event store.
//!
//! Intended for tests and development. Semantics match the durable
//! backend exactly: append-only, hash-verified, idempotent on
//! event_id, replay-isolated.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use bos_core::{BusinessId, Clock, EventId};
use bos_events::{EventRecord, EventTypeRegistry, GENESIS_HASH};

use super::r#trait::{ChainedEvent, EventStore, EventStoreError, ReadQuery};
use crate::replay_gate::ReplayGate;

#[derive(Default)]
struct Inner {
    chains: HashMap<BusinessId, Vec<EventRecord>>,
    by_event_id: HashMap<EventId, BusinessId>,
}

/// Append-only in-memory store.
pub struct MemoryEventStore {
    registry: Arc<EventTypeRegistry>,
    clock: Arc<dyn Clock>,
    replay_gate: Arc<ReplayGate>,
    inner: RwLock<Inner>,
}

impl MemoryEventStore {
    pub fn new(
        registry: Arc<EventTypeRegistry>,
        clock: Arc<dyn Clock>,
        replay_gate: Arc<ReplayGate>,
    ) -> Self {
        Self {
            registry,
            clock,
            replay_gate,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Total number of stored events across all businesses.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_event_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next `received_at`: strictly after the chain tip so that
    /// `(received_at, event_id)` order equals append order.
    fn next_received_at(chain: &[EventRecord], now: DateTime<Utc>) -> DateTime<Utc> {
        match chain.last() {
            Some(last) if last.received_at >= now => {
                last.received_at + Duration::microseconds(1)
            }
            _ => now,
        }
    }

    fn validate_batch(
        business_id: BusinessId,
        events: &[ChainedEvent],
        registry: &EventTypeRegistry,
    ) -> Result<(), EventStoreError> {
        for event in events {
            let candidate = &event.candidate;
            if candidate.business_id != business_id {
                return Err(EventStoreError::TenantIsolation(format!(
                    "event {} targets a different business",
                    candidate.event_id
                )));
            }
            if !registry.is_registered(&candidate.event_type) {
                return Err(EventStoreError::UnknownEventType(
                    candidate.event_type.clone(),
                ));
            }
            // The hash must recompute from the claimed predecessor.
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
        Ok(())
    }
}

impl EventStore for MemoryEventStore {
    fn append(
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

        Self::validate_batch(business_id, &events, &self.registry)?;

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        // Idempotency: an identical resubmission returns the stored
        // records unchanged; a differing payload is a conflict. A
        // batch that mixes stored and new events is never valid.
        let stored_count = events
            .iter()
            .filter(|e| inner.by_event_id.contains_key(&e.candidate.event_id))
            .count();
        if stored_count == events.len() {
            let chain = inner.chains.get(&business_id).cloned().unwrap_or_default();
            let mut replayed = Vec::with_capacity(events.len());
            for event in &events {
                let existing = chain
                    .iter()
                    .find(|r| r.event_id == event.candidate.event_id)
                    .ok_or_else(|| {
                        EventStoreError::TenantIsolation(
                            "duplicate event_id belongs to a different business".to_string(),
                        )
                    })?;
                if existing.event_hash != event.event_hash {
                    return Err(EventStoreError::IdempotencyConflict(
                        event.candidate.event_id,
                    ));
                }
                replayed.push(existing.clone());
            }
            tracing::debug!(
                %business_id,
                count = replayed.len(),
                "idempotent re-append returned stored events"
            );
            return Ok(replayed);
        }
        if stored_count > 0 {
            let first_dup = events
                .iter()
                .find(|e| inner.by_event_id.contains_key(&e.candidate.event_id))
                .map(|e| e.candidate.event_id)
                .unwrap_or_else(EventId::new);
            return Err(EventStoreError::IdempotencyConflict(first_dup));
        }

        // Chain continuity against the current tip, then within the
        // batch.
        let tip = inner
            .chains
            .get(&business_id)
            .and_then(|chain| chain.last())
            .map(|record| record.event_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut expected = tip;
        for event in &events {
            if event.previous_event_hash != expected {
                return Err(EventStoreError::ChainMismatch {
                    expected,
                    found: event.previous_event_hash.clone(),
                });
            }
            expected = event.event_hash.clone();
        }

        // Commit: assign received_at and insert.
        let now = self.clock.now_utc();
        let mut committed = Vec::with_capacity(events.len());
        let chain = inner.chains.entry(business_id).or_default();
        for event in events {
            let received_at = Self::next_received_at(chain, now);
            let record = event.candidate.into_record(
                received_at,
                event.previous_event_hash,
                event.event_hash,
            );
            chain.push(record.clone());
            committed.push(record);
        }
        for record in &committed {
            inner.by_event_id.insert(record.event_id, business_id);
        }

        tracing::debug!(%business_id, count = committed.len(), "events appended");
        Ok(committed)
    }

    fn chain_tip(&self, business_id: BusinessId) -> Result<Option<String>, EventStoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .chains
            .get(&business_id)
            .and_then(|chain| chain.last())
            .map(|record| record.event_hash.clone()))
    }

    fn read(
        &self,
        business_id: BusinessId,
        query: &ReadQuery,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let chain = inner.chains.get(&business_id);

        let mut records: Vec<EventRecord> = chain
            .map(|chain| {
                chain
                    .iter()
                    .filter(|r| query.since.is_none_or(|since| r.received_at >= since))
                    .filter(|r| query.until.is_none_or(|until| r.received_at <= until))
                    .filter(|r| {
                        query.after.is_none_or(|cursor| {
                            (r.received_at, r.event_id)
                                > (cursor.received_at, cursor.event_id)
                        })
                    })
                    .filter(|r| {
                        query.event_types.is_empty()
                            || query.event_types.iter().any(|t| *t == r.event_type)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        records.sort_by_key(|r| (r.received_at, r.event_id));
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    fn get_by_event_id(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.by_event_id.get(&event_id) != Some(&business_id) {
            return Ok(None);
        }
        Ok(inner
            .chains
            .get(&business_id)
            .and_then(|chain| chain.iter().find(|r| r.event_id == event_id))
            .cloned())
    }

    fn verify_chain(&self, business_id: BusinessId) -> Result<usize, EventStoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(chain) = inner.chains.get(&business_id) else {
            return Ok(0);
        };

        let mut expected = GENESIS_HASH.to_string();
        for record in chain {
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
        Ok(chain.len())
    }

    fn businesses(&self) -> Result<Vec<BusinessId>, EventStoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut businesses: Vec<BusinessId> = inner.chains.keys().copied().collect();
        businesses.sort_unstable();
        Ok(businesses)
    }
}

impl core::fmt::Debug for MemoryEventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryEventStore")
            .field("events", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_core::{ActorType, CorrelationId, FixedClock};
    use bos_events::{CandidateEvent, EventStatus};
    use chrono::TimeZone;

    fn setup() -> (MemoryEventStore, Arc<ReplayGate>, BusinessId) {
        let registry = Arc::new(EventTypeRegistry::new());
        registry.register("test.thing.done.v1").unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let gate = ReplayGate::new();
        let store = MemoryEventStore::new(registry, clock, Arc::clone(&gate));
        (store, gate, BusinessId::new())
    }

    fn candidate(business_id: BusinessId, n: u64) -> CandidateEvent {
        CandidateEvent {
            event_id: EventId::new(),
            event_type: "test.thing.done.v1".to_string(),
            event_version: 1,
            business_id,
            branch_id: None,
            source_engine: "test".to_string(),
            actor_type: ActorType::System,
            actor_id: "sys".to_string(),
            correlation_id: CorrelationId::new(),
            causation_id: None,
            payload: serde_json::json!({"n": n}),
            reference: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            status: EventStatus::Final,
            correction_of: None,
        }
    }

    fn chained(store: &MemoryEventStore, business_id: BusinessId, n: u64) -> ChainedEvent {
        let tip = store
            .chain_tip(business_id)
            .unwrap()
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        ChainedEvent::seal(candidate(business_id, n), tip).unwrap()
    }

    #[test]
    fn genesis_append_links_to_sentinel() {
        let (store, _gate, business) = setup();
        let committed = store.append(business, vec![chained(&store, business, 1)]).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].previous_event_hash, GENESIS_HASH);
        assert!(!committed[0].event_hash.is_empty());
    }

    #[test]
    fn chain_continues_from_tip() {
        let (store, _gate, business) = setup();
        let first = store.append(business, vec![chained(&store, business, 1)]).unwrap();
        let second = store.append(business, vec![chained(&store, business, 2)]).unwrap();
        assert_eq!(second[0].previous_event_hash, first[0].event_hash);
        assert_eq!(store.verify_chain(business).unwrap(), 2);
    }

    #[test]
    fn stale_tip_is_a_chain_mismatch() {
        let (store, _gate, business) = setup();
        let stale = chained(&store, business, 1);
        store.append(business, vec![chained(&store, business, 2)]).unwrap();

        let err = store.append(business, vec![stale]).unwrap_err();
        assert!(matches!(err, EventStoreError::ChainMismatch { .. }));
    }

    #[test]
    fn identical_reappend_returns_stored_event() {
        let (store, _gate, business) = setup();
        let event = chained(&store, business, 1);
        let first = store.append(business, vec![event.clone()]).unwrap();
        let again = store.append(business, vec![event]).unwrap();

        assert_eq!(first, again);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn differing_payload_with_same_event_id_conflicts() {
        let (store, _gate, business) = setup();
        let event = chained(&store, business, 1);
        store.append(business, vec![event.clone()]).unwrap();

        let mut tampered_candidate = event.candidate.clone();
        tampered_candidate.payload = serde_json::json!({"n": 999});
        let tampered =
            ChainedEvent::seal(tampered_candidate, event.previous_event_hash.clone()).unwrap();

        let err = store.append(business, vec![tampered]).unwrap_err();
        assert!(matches!(err, EventStoreError::IdempotencyConflict(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let (store, _gate, business) = setup();
        let mut candidate = candidate(business, 1);
        candidate.event_type = "ghost.thing.done.v1".to_string();
        let event = ChainedEvent::seal(candidate, GENESIS_HASH.to_string()).unwrap();

        let err = store.append(business, vec![event]).unwrap_err();
        assert!(matches!(err, EventStoreError::UnknownEventType(_)));
    }

    #[test]
    fn append_is_blocked_during_replay() {
        let (store, gate, business) = setup();
        let event = chained(&store, business, 1);
        let lease = gate.acquire();
        let err = store.append(business, vec![event.clone()]).unwrap_err();
        assert!(matches!(err, EventStoreError::ReplayIsolation));
        drop(lease);
        store.append(business, vec![event]).unwrap();
    }

    #[test]
    fn reads_are_tenant_scoped() {
        let (store, _gate, business_a) = setup();
        let business_b = BusinessId::new();
        store.append(business_a, vec![chained(&store, business_a, 1)]).unwrap();
        store.append(business_b, vec![chained(&store, business_b, 2)]).unwrap();

        let records = store.read(business_a, &ReadQuery::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records.iter().all(|r| r.business_id == business_a));
    }

    #[test]
    fn cursor_resumes_without_skipping() {
        let (store, _gate, business) = setup();
        for n in 0..5 {
            store.append(business, vec![chained(&store, business, n)]).unwrap();
        }

        let first_page = store
            .read(
                business,
                &ReadQuery {
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(first_page.len(), 2);

        let cursor = bos_events::ProjectionCursor::of(first_page.last().unwrap());
        let rest = store
            .read(
                business,
                &ReadQuery {
                    after: Some(cursor),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(rest.len(), 3);

        let all = store.read(business, &ReadQuery::default()).unwrap();
        let stitched: Vec<_> = first_page.iter().chain(rest.iter()).collect();
        let direct: Vec<_> = all.iter().collect();
        assert_eq!(stitched, direct);
    }

    #[test]
    fn received_at_is_strictly_increasing_per_business() {
        let (store, _gate, business) = setup();
        // The fixed clock never advances; the store must still order.
        for n in 0..4 {
            store.append(business, vec![chained(&store, business, n)]).unwrap();
        }
        let records = store.read(business, &ReadQuery::default()).unwrap();
        for pair in records.windows(2) {
            assert!(pair[0].received_at < pair[1].received_at);
        }
    }

    #[test]
    fn batch_appends_atomically_in_order() {
        let (store, _gate, business) = setup();
        let c1 = candidate(business, 1);
        let c2 = candidate(business, 2);
        let e1 = ChainedEvent::seal(c1, GENESIS_HASH.to_string()).unwrap();
        let e2 = ChainedEvent::seal(c2, e1.event_hash.clone()).unwrap();

        let committed = store.append(business, vec![e1, e2]).unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(committed[1].previous_event_hash, committed[0].event_hash);
        assert_eq!(store.verify_chain(business).unwrap(), 2);
    }

    #[test]
    fn broken_batch_chain_rejects_whole_batch() {
        let (store, _gate, business) = setup();
        let e1 = ChainedEvent::seal(candidate(business, 1), GENESIS_HASH.to_string()).unwrap();
        // Second event wrongly chains to GENESIS instead of e1.
        let e2 = ChainedEvent::seal(candidate(business, 2), GENESIS_HASH.to_string()).unwrap();

        let err = store.append(business, vec![e1, e2]).unwrap_err();
        assert!(matches!(err, EventStoreError::ChainMismatch { .. }));
        assert_eq!(store.len(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// For any append sequence, the chain verifies and reads
            /// come back in exact append order.
            #[test]
            fn chain_verifies_for_any_append_sequence(
                values in prop::collection::vec(any::<i64>(), 1..20)
            ) {
                let (store, _gate, business) = setup();
                for value in &values {
                    let tip = store
                        .chain_tip(business)
                        .unwrap()
                        .unwrap_or_else(|| GENESIS_HASH.to_string());
                    let mut event = candidate(business, 0);
                    event.payload = serde_json::json!({"n": value});
                    store
                        .append(business, vec![ChainedEvent::seal(event, tip).unwrap()])
                        .unwrap();
                }

                prop_assert_eq!(store.verify_chain(business).unwrap(), values.len());

                let records = store.read(business, &ReadQuery::default()).unwrap();
                let read_back: Vec<i64> = records
                    .iter()
                    .map(|r| r.payload["n"].as_i64().unwrap())
                    .collect();
                prop_assert_eq!(read_back, values);
            }
        }
    }
}
