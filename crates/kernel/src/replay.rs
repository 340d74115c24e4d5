//! Replay engine — the time machine.
//!
//! Replay reads history and folds it back through projections. It
//! never writes to the event store; while a replay lease is active
//! the store refuses every append. The engine verifies chain
//! structure before applying, supports business/time/projection
//! scoping, snapshot starts, and resumable checkpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use bos_core::BusinessId;
use bos_events::ProjectionCursor;

use crate::event_store::{EventStore, EventStoreError, ReadQuery};
use crate::projections::{ProjectionRuntime, RuntimeError};
use crate::replay_gate::ReplayGate;
use crate::snapshots::SnapshotStore;

/// Replay scope must be explicit: unscoped replays are deliberate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayScope {
    Business(BusinessId),
    Unscoped,
}

/// Options for one replay run.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub scope: ReplayScope,
    /// Upper bound on `received_at` (time travel).
    pub until: Option<DateTime<Utc>>,
    /// Target projections; `None` means all registered.
    pub projections: Option<Vec<String>>,
    /// Start from the newest eligible snapshot instead of zero.
    pub from_snapshot: bool,
}

impl ReplayOptions {
    pub fn business(business_id: BusinessId) -> Self {
        Self {
            scope: ReplayScope::Business(business_id),
            until: None,
            projections: None,
            from_snapshot: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Structured result of a replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub events_processed: usize,
    pub chain_verified: bool,
    pub snapshot_used: bool,
}

/// Resumable replay checkpoint per `(projection, business)`.
///
/// Checkpoints are operational metadata, not events: they may be
/// overwritten or cleared freely.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    checkpoints: Mutex<HashMap<(String, BusinessId), ProjectionCursor>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, projection: &str, business_id: BusinessId, cursor: ProjectionCursor) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((projection.to_string(), business_id), cursor);
    }

    pub fn load(&self, projection: &str, business_id: BusinessId) -> Option<ProjectionCursor> {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(projection.to_string(), business_id))
            .copied()
    }

    pub fn clear(&self, projection: &str, business_id: BusinessId) {
        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(projection.to_string(), business_id));
    }
}

/// Drives replays against a store, a runtime, and a snapshot store.
pub struct ReplayEngine<S> {
    store: Arc<S>,
    gate: Arc<ReplayGate>,
    checkpoints: CheckpointStore,
}

impl<S: EventStore> ReplayEngine<S> {
    pub fn new(store: Arc<S>, gate: Arc<ReplayGate>) -> Self {
        Self {
            store,
            gate,
            checkpoints: CheckpointStore::new(),
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Rebuild the targeted projections.
    ///
    /// Holding the replay lease for the whole run blocks every append
    /// store-wide; per-business commit exclusion comes from the
    /// tenant lock the caller (the kernel) takes around this call.
    pub fn replay(
        &self,
        runtime: &mut ProjectionRuntime,
        snapshots: &dyn SnapshotStore,
        options: &ReplayOptions,
    ) -> Result<ReplayReport, ReplayError> {
        match options.scope {
            ReplayScope::Business(business_id) => {
                self.replay_business(runtime, snapshots, options, business_id)
            }
            ReplayScope::Unscoped => {
                // Deliberate full-system replay: every business chain,
                // one at a time, in sorted order.
                let mut report = ReplayReport {
                    chain_verified: true,
                    ..Default::default()
                };
                for business_id in self.store.businesses()? {
                    let partial =
                        self.replay_business(runtime, snapshots, options, business_id)?;
                    report.events_processed += partial.events_processed;
                    report.snapshot_used |= partial.snapshot_used;
                    report.chain_verified &= partial.chain_verified;
                }
                Ok(report)
            }
        }
    }

    fn replay_business(
        &self,
        runtime: &mut ProjectionRuntime,
        snapshots: &dyn SnapshotStore,
        options: &ReplayOptions,
        business_id: BusinessId,
    ) -> Result<ReplayReport, ReplayError> {
        let _lease = self.gate.acquire();
        let mut report = ReplayReport::default();

        // Verify the stored chain before trusting it.
        self.store.verify_chain(business_id)?;
        report.chain_verified = true;

        let targets: Vec<String> = options
            .projections
            .clone()
            .unwrap_or_else(|| runtime.projection_names());

        // Clear targeted projections, then optionally restore the
        // newest eligible snapshot per projection.
        runtime.truncate(&targets, Some(business_id))?;

        let target_cursor = options.until.map(|until| {
            ProjectionCursor::new(until, bos_core::EventId::from_uuid(uuid::Uuid::max()))
        });

        let mut start_cursors: HashMap<String, Option<ProjectionCursor>> = HashMap::new();
        for name in &targets {
            let mut start = None;
            if options.from_snapshot {
                if let Some(snapshot) = snapshots.latest(name, business_id, target_cursor) {
                    runtime.restore(name, business_id, &snapshot.bytes, snapshot.cursor)?;
                    start = Some(snapshot.cursor);
                    report.snapshot_used = true;
                }
            }
            start_cursors.insert(name.clone(), start);
        }

        // Iterate the log once from the earliest start cursor; the
        // per-business projection cursors make earlier events no-ops
        // for projections restored from a newer snapshot.
        let earliest = start_cursors
            .values()
            .min()
            .copied()
            .flatten();

        let query = ReadQuery {
            until: options.until,
            after: earliest,
            ..Default::default()
        };
        let events = self.store.read(business_id, &query)?;

        runtime.apply_scoped(&events, &targets);
        report.events_processed = events.len();

        for name in &targets {
            if let Some(cursor) = runtime.cursor(name, business_id) {
                self.checkpoints.save(name, business_id, cursor);
            }
        }

        tracing::info!(
            %business_id,
            events = report.events_processed,
            projections = targets.len(),
            snapshot_used = report.snapshot_used,
            "replay complete"
        );
        Ok(report)
    }
}

impl<S> core::fmt::Debug for ReplayEngine<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReplayEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_core::EventId;
    use chrono::TimeZone;

    fn cursor(seconds: u32) -> ProjectionCursor {
        ProjectionCursor::new(
            chrono::Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, seconds).unwrap(),
            EventId::from_uuid(uuid::Uuid::from_u128(u128::from(seconds))),
        )
    }

    #[test]
    fn checkpoints_save_load_and_clear() {
        let store = CheckpointStore::new();
        let business = BusinessId::new();

        assert!(store.load("retail.sales", business).is_none());
        store.save("retail.sales", business, cursor(10));
        assert_eq!(store.load("retail.sales", business), Some(cursor(10)));

        // Overwriting is allowed: checkpoints are metadata, not events.
        store.save("retail.sales", business, cursor(20));
        assert_eq!(store.load("retail.sales", business), Some(cursor(20)));

        store.clear("retail.sales", business);
        assert!(store.load("retail.sales", business).is_none());
    }

    #[test]
    fn checkpoints_are_scoped_per_projection_and_business() {
        let store = CheckpointStore::new();
        let business_a = BusinessId::new();
        let business_b = BusinessId::new();
        store.save("retail.sales", business_a, cursor(5));

        assert!(store.load("retail.sales", business_b).is_none());
        assert!(store.load("cash.drawers", business_a).is_none());
    }
}
