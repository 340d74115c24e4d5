//! Projection runtime.
//!
//! Owns every registered projection and its cursor, applies committed
//! events in a single deterministic order (event, then projections
//! sorted by name), and enforces idempotency: an event at or before a
//! projection's cursor is a no-op.

use std::collections::BTreeMap;

use thiserror::Error;

use bos_core::BusinessId;
use bos_events::{EventRecord, Projection, ProjectionCursor, ProjectionError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("projection '{0}' is already registered")]
    DuplicateProjection(String),

    #[error("projection '{0}' is not registered")]
    UnknownProjection(String),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

struct Registered {
    projection: Box<dyn Projection>,
    // Cursors are per business: only per-tenant order is total.
    cursors: BTreeMap<BusinessId, ProjectionCursor>,
}

impl Registered {
    fn behind(&self, record: &EventRecord, position: ProjectionCursor) -> bool {
        self.cursors
            .get(&record.business_id)
            .is_some_and(|cursor| position <= *cursor)
    }
}

/// Deterministic fold of committed events into read models.
#[derive(Default)]
pub struct ProjectionRuntime {
    // BTreeMap keeps application order stable by projection name.
    projections: BTreeMap<String, Registered>,
}

impl ProjectionRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, projection: Box<dyn Projection>) -> Result<(), RuntimeError> {
        let name = projection.name().to_string();
        if self.projections.contains_key(&name) {
            return Err(RuntimeError::DuplicateProjection(name));
        }
        self.projections.insert(
            name,
            Registered {
                projection,
                cursors: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn projection_names(&self) -> Vec<String> {
        self.projections.keys().cloned().collect()
    }

    pub fn cursor(&self, name: &str, business_id: BusinessId) -> Option<ProjectionCursor> {
        self.projections
            .get(name)
            .and_then(|r| r.cursors.get(&business_id).copied())
    }

    /// Apply committed events in order to every subscribed projection.
    ///
    /// Events at or before a projection's cursor are skipped, so
    /// at-least-once delivery and replays cannot double-apply.
    pub fn apply_committed(&mut self, events: &[EventRecord]) {
        for record in events {
            let position = ProjectionCursor::of(record);
            for registered in self.projections.values_mut() {
                if !registered.projection.subscribes_to(&record.event_type) {
                    continue;
                }
                if registered.behind(record, position) {
                    continue;
                }
                registered.projection.apply(record);
                registered.cursors.insert(record.business_id, position);
            }
        }
    }

    /// Apply events to a named subset only (replay path).
    pub fn apply_scoped(&mut self, events: &[EventRecord], targets: &[String]) {
        for record in events {
            let position = ProjectionCursor::of(record);
            for (name, registered) in self.projections.iter_mut() {
                if !targets.contains(name) {
                    continue;
                }
                if !registered.projection.subscribes_to(&record.event_type) {
                    continue;
                }
                if registered.behind(record, position) {
                    continue;
                }
                registered.projection.apply(record);
                registered.cursors.insert(record.business_id, position);
            }
        }
    }

    /// Reset the named projections (all businesses or one).
    pub fn truncate(
        &mut self,
        targets: &[String],
        business_id: Option<BusinessId>,
    ) -> Result<(), RuntimeError> {
        for name in targets {
            let registered = self
                .projections
                .get_mut(name)
                .ok_or_else(|| RuntimeError::UnknownProjection(name.clone()))?;
            match business_id {
                Some(business) => {
                    registered.projection.truncate_business(business);
                    registered.cursors.remove(&business);
                }
                None => {
                    registered.projection.truncate();
                    registered.cursors.clear();
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(
        &self,
        name: &str,
        business_id: BusinessId,
    ) -> Result<Vec<u8>, RuntimeError> {
        let registered = self
            .projections
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownProjection(name.to_string()))?;
        Ok(registered.projection.snapshot(business_id)?)
    }

    pub fn restore(
        &mut self,
        name: &str,
        business_id: BusinessId,
        bytes: &[u8],
        cursor: ProjectionCursor,
    ) -> Result<(), RuntimeError> {
        let registered = self
            .projections
            .get_mut(name)
            .ok_or_else(|| RuntimeError::UnknownProjection(name.to_string()))?;
        registered.projection.restore(business_id, bytes)?;
        registered.cursors.insert(business_id, cursor);
        Ok(())
    }

    /// Read-only view handed to command handlers.
    pub fn view(&self) -> ProjectionView<'_> {
        ProjectionView { runtime: self }
    }
}

impl core::fmt::Debug for ProjectionRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionRuntime")
            .field("projections", &self.projection_names())
            .finish()
    }
}

/// Read-only access to registered projections.
///
/// Handlers use `get` to downcast to a concrete read model; they
/// cannot reach mutation paths through this view.
#[derive(Clone, Copy)]
pub struct ProjectionView<'a> {
    runtime: &'a ProjectionRuntime,
}

impl<'a> ProjectionView<'a> {
    pub fn get<P: 'static>(&self, name: &str) -> Option<&'a P> {
        self.runtime
            .projections
            .get(name)
            .and_then(|r| r.projection.as_any().downcast_ref::<P>())
    }

    pub fn cursor(&self, name: &str, business_id: BusinessId) -> Option<ProjectionCursor> {
        self.runtime.cursor(name, business_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_core::{ActorType, CorrelationId, EventId};
    use bos_events::{CandidateEvent, EventStatus, GENESIS_HASH};
    use chrono::{Duration, TimeZone, Utc};
    use std::any::Any;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Counts payload `n` values per business, in apply order.
    struct SumProjection {
        name: String,
        sums: Mutex<BTreeMap<BusinessId, i64>>,
    }

    impl SumProjection {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                sums: Mutex::new(BTreeMap::new()),
            }
        }

        fn sum(&self, business: BusinessId) -> i64 {
            *self.sums.lock().unwrap().get(&business).unwrap_or(&0)
        }
    }

    impl Projection for SumProjection {
        fn name(&self) -> &str {
            &self.name
        }

        fn subscribes_to(&self, event_type: &str) -> bool {
            event_type == "test.thing.done.v1"
        }

        fn apply(&mut self, record: &EventRecord) {
            let n = record.payload["n"].as_i64().unwrap_or(0);
            *self
                .sums
                .lock()
                .unwrap()
                .entry(record.business_id)
                .or_insert(0) += n;
        }

        fn truncate(&mut self) {
            self.sums.lock().unwrap().clear();
        }

        fn truncate_business(&mut self, business_id: BusinessId) {
            self.sums.lock().unwrap().remove(&business_id);
        }

        fn snapshot(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
            serde_json::to_vec(&self.sum(business_id))
                .map_err(|e| ProjectionError::Encode(e.to_string()))
        }

        fn restore(
            &mut self,
            business_id: BusinessId,
            bytes: &[u8],
        ) -> Result<(), ProjectionError> {
            let sum: i64 = serde_json::from_slice(bytes)
                .map_err(|e| ProjectionError::Decode(e.to_string()))?;
            self.sums.lock().unwrap().insert(business_id, sum);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn record(business: BusinessId, n: i64, offset_us: i64) -> EventRecord {
        let created = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let candidate = CandidateEvent {
            event_id: EventId::new(),
            event_type: "test.thing.done.v1".to_string(),
            event_version: 1,
            business_id: business,
            branch_id: None,
            source_engine: "test".to_string(),
            actor_type: ActorType::System,
            actor_id: "sys".to_string(),
            correlation_id: CorrelationId::new(),
            causation_id: None,
            payload: serde_json::json!({"n": n}),
            reference: None,
            created_at: created,
            status: EventStatus::Final,
            correction_of: None,
        };
        let hash = candidate.chain_hash(GENESIS_HASH).unwrap();
        candidate.into_record(
            created + Duration::microseconds(offset_us),
            GENESIS_HASH.to_string(),
            hash,
        )
    }

    #[test]
    fn applying_same_event_twice_is_a_noop() {
        let mut runtime = ProjectionRuntime::new();
        runtime
            .register(Box::new(SumProjection::new("test.sum")))
            .unwrap();

        let business = BusinessId::new();
        let event = record(business, 5, 0);
        runtime.apply_committed(std::slice::from_ref(&event));
        runtime.apply_committed(std::slice::from_ref(&event));

        let view = runtime.view();
        let projection: &SumProjection = view.get("test.sum").unwrap();
        assert_eq!(projection.sum(business), 5);
    }

    #[test]
    fn cursor_advances_with_application() {
        let mut runtime = ProjectionRuntime::new();
        runtime
            .register(Box::new(SumProjection::new("test.sum")))
            .unwrap();

        let business = BusinessId::new();
        assert!(runtime.cursor("test.sum", business).is_none());

        let event = record(business, 1, 0);
        runtime.apply_committed(std::slice::from_ref(&event));
        assert_eq!(
            runtime.cursor("test.sum", business),
            Some(ProjectionCursor::of(&event))
        );
    }

    #[test]
    fn truncate_resets_state_and_cursor() {
        let mut runtime = ProjectionRuntime::new();
        runtime
            .register(Box::new(SumProjection::new("test.sum")))
            .unwrap();

        let business = BusinessId::new();
        runtime.apply_committed(&[record(business, 7, 0)]);
        runtime
            .truncate(&["test.sum".to_string()], None)
            .unwrap();

        let view = runtime.view();
        let projection: &SumProjection = view.get("test.sum").unwrap();
        assert_eq!(projection.sum(business), 0);
        assert!(runtime.cursor("test.sum", business).is_none());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut runtime = ProjectionRuntime::new();
        runtime
            .register(Box::new(SumProjection::new("test.sum")))
            .unwrap();

        let business = BusinessId::new();
        let e1 = record(business, 3, 0);
        let e2 = record(business, 4, 1);
        runtime.apply_committed(&[e1, e2.clone()]);

        let bytes = runtime.snapshot("test.sum", business).unwrap();
        runtime.truncate(&["test.sum".to_string()], None).unwrap();
        runtime
            .restore("test.sum", business, &bytes, ProjectionCursor::of(&e2))
            .unwrap();

        let view = runtime.view();
        let projection: &SumProjection = view.get("test.sum").unwrap();
        assert_eq!(projection.sum(business), 7);
        assert_eq!(
            runtime.cursor("test.sum", business),
            Some(ProjectionCursor::of(&e2))
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut runtime = ProjectionRuntime::new();
        runtime
            .register(Box::new(SumProjection::new("test.sum")))
            .unwrap();
        let err = runtime
            .register(Box::new(SumProjection::new("test.sum")))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateProjection(_)));
    }
}
