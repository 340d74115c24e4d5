//! Append-only projection snapshots.
//!
//! A snapshot captures one projection's state for one business at a
//! cursor. Snapshots are never updated or deleted; time-travel picks
//! the newest snapshot at or before the target cursor and replays the
//! remainder of the log.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bos_core::BusinessId;
use bos_events::ProjectionCursor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub projection_name: String,
    pub business_id: BusinessId,
    pub cursor: ProjectionCursor,
    pub bytes: Vec<u8>,
    pub taken_at: DateTime<Utc>,
}

/// Append-only snapshot store.
pub trait SnapshotStore: Send + Sync {
    fn append(&self, record: SnapshotRecord);

    /// Newest snapshot for `(projection, business)`, optionally
    /// bounded by a target cursor (time travel).
    fn latest(
        &self,
        projection_name: &str,
        business_id: BusinessId,
        at_or_before: Option<ProjectionCursor>,
    ) -> Option<SnapshotRecord>;

    fn count(&self) -> usize;
}

/// In-memory snapshot store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    records: RwLock<Vec<SnapshotRecord>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn append(&self, record: SnapshotRecord) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(
            projection = %record.projection_name,
            business_id = %record.business_id,
            "snapshot appended"
        );
        records.push(record);
    }

    fn latest(
        &self,
        projection_name: &str,
        business_id: BusinessId,
        at_or_before: Option<ProjectionCursor>,
    ) -> Option<SnapshotRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .iter()
            .filter(|r| r.projection_name == projection_name && r.business_id == business_id)
            .filter(|r| at_or_before.is_none_or(|target| r.cursor <= target))
            .max_by_key(|r| r.cursor)
            .cloned()
    }

    fn count(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_core::EventId;
    use chrono::TimeZone;

    fn cursor(seconds: u32) -> ProjectionCursor {
        ProjectionCursor::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, seconds).unwrap(),
            EventId::from_uuid(uuid::Uuid::from_u128(u128::from(seconds))),
        )
    }

    fn snapshot(business: BusinessId, seconds: u32, marker: u8) -> SnapshotRecord {
        SnapshotRecord {
            projection_name: "kernel.feature_flags".to_string(),
            business_id: business,
            cursor: cursor(seconds),
            bytes: vec![marker],
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn latest_picks_newest_at_or_before_target() {
        let store = MemorySnapshotStore::new();
        let business = BusinessId::new();
        store.append(snapshot(business, 10, 1));
        store.append(snapshot(business, 20, 2));
        store.append(snapshot(business, 30, 3));

        let picked = store
            .latest("kernel.feature_flags", business, Some(cursor(25)))
            .unwrap();
        assert_eq!(picked.bytes, vec![2]);

        let unbounded = store.latest("kernel.feature_flags", business, None).unwrap();
        assert_eq!(unbounded.bytes, vec![3]);
    }

    #[test]
    fn snapshots_are_tenant_scoped() {
        let store = MemorySnapshotStore::new();
        let business_a = BusinessId::new();
        let business_b = BusinessId::new();
        store.append(snapshot(business_a, 10, 1));

        assert!(store.latest("kernel.feature_flags", business_b, None).is_none());
    }

    #[test]
    fn append_never_replaces() {
        let store = MemorySnapshotStore::new();
        let business = BusinessId::new();
        store.append(snapshot(business, 10, 1));
        store.append(snapshot(business, 10, 2));
        assert_eq!(store.count(), 2);
    }
}
