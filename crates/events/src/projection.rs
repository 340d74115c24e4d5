//! Projection contract — deterministic folds over the event log.
//!
//! Read models are disposable; the log is authoritative. A projection
//! never reads anything outside its own state and the event it is
//! handed. The runtime (in the kernel crate) owns cursor tracking and
//! replay.

use std::any::Any;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use bos_core::{BusinessId, EventId};

use crate::record::EventRecord;

/// Composite position in the per-tenant total order
/// `(received_at ASC, event_id ASC)`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProjectionCursor {
    pub received_at: DateTime<Utc>,
    pub event_id: EventId,
}

impl ProjectionCursor {
    pub fn new(received_at: DateTime<Utc>, event_id: EventId) -> Self {
        Self {
            received_at,
            event_id,
        }
    }

    pub fn of(record: &EventRecord) -> Self {
        Self::new(record.received_at, record.event_id)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("failed to decode projection state: {0}")]
    Decode(String),

    #[error("snapshot encode failed: {0}")]
    Encode(String),
}

/// A named read model folded from events.
///
/// Implementations must be pure folds: `apply` may only depend on the
/// record and current state, and applying the same log prefix to an
/// empty projection must always yield byte-identical `snapshot()`
/// output.
pub trait Projection: Send + Sync {
    /// Stable projection name (used for cursors, snapshots, ordering).
    fn name(&self) -> &str;

    /// Whether this projection consumes the given event type.
    fn subscribes_to(&self, event_type: &str) -> bool;

    /// Fold one event into the read model.
    fn apply(&mut self, record: &EventRecord);

    /// Drop all state for every business.
    fn truncate(&mut self);

    /// Drop state for a single business (scoped rebuilds).
    fn truncate_business(&mut self, business_id: BusinessId);

    /// Serialize the read model for one business. Must be
    /// deterministic: equal state yields equal bytes.
    fn snapshot(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError>;

    /// Restore one business's state from `snapshot()` bytes.
    fn restore(&mut self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError>;

    /// Downcast support for read-only views.
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cursor_orders_by_time_then_event_id() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 1).unwrap();
        let id_lo = EventId::from_uuid(uuid::Uuid::from_u128(1));
        let id_hi = EventId::from_uuid(uuid::Uuid::from_u128(2));

        assert!(ProjectionCursor::new(t0, id_hi) < ProjectionCursor::new(t1, id_lo));
        assert!(ProjectionCursor::new(t0, id_lo) < ProjectionCursor::new(t0, id_hi));
    }
}
