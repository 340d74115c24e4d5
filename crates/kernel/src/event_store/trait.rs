//! Event store contract.
//!
//! Append-only, tenant-scoped, hash-chained. The store forbids UPDATE
//! and DELETE on event records; only INSERT exists. Reads never cross
//! tenants. `received_at` is store-assigned, strictly increasing per
//! business, so the `(received_at, event_id)` order equals append
//! order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use bos_core::{BusinessId, EventId, Rejection, RejectionCode};
use bos_events::{CandidateEvent, EventRecord, ProjectionCursor};

/// A candidate event the bus has already chained: hashes are computed
/// against the business chain tip under the tenant write lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedEvent {
    pub candidate: CandidateEvent,
    pub previous_event_hash: String,
    pub event_hash: String,
}

impl ChainedEvent {
    /// Chain a candidate onto the given predecessor hash.
    pub fn seal(
        candidate: CandidateEvent,
        previous_event_hash: String,
    ) -> Result<Self, bos_events::CanonicalError> {
        let event_hash = candidate.chain_hash(&previous_event_hash)?;
        Ok(Self {
            candidate,
            previous_event_hash,
            event_hash,
        })
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("chain mismatch: expected previous hash '{expected}', found '{found}'")]
    ChainMismatch { expected: String, found: String },

    #[error("hash mismatch for event {event_id}: {message}")]
    HashMismatch { event_id: EventId, message: String },

    #[error("event {0} already exists with a different payload")]
    IdempotencyConflict(EventId),

    #[error("event type '{0}' is not registered")]
    UnknownEventType(String),

    #[error("append batch is tenant-inconsistent: {0}")]
    TenantIsolation(String),

    #[error("business_id missing from append")]
    MissingBusinessId,

    #[error("persistence forbidden while replay is active")]
    ReplayIsolation,

    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl EventStoreError {
    /// Deterministic mapping into the closed rejection set.
    pub fn to_rejection(&self) -> Rejection {
        let code = match self {
            EventStoreError::ChainMismatch { .. } => RejectionCode::ChainMismatch,
            EventStoreError::HashMismatch { .. } => RejectionCode::HashMismatch,
            EventStoreError::IdempotencyConflict(_) => RejectionCode::IdempotencyConflict,
            EventStoreError::UnknownEventType(_) => RejectionCode::UnknownEventType,
            EventStoreError::MissingBusinessId => RejectionCode::MissingBusinessId,
            EventStoreError::TenantIsolation(_) => RejectionCode::GuardInternalError,
            EventStoreError::ReplayIsolation | EventStoreError::Unavailable(_) => {
                RejectionCode::StoreUnavailable
            }
        };
        Rejection::new(code, self.to_string(), "event_store")
    }
}

/// Tenant-scoped, cursor-resumable read query.
///
/// Results are always ordered `(received_at ASC, event_id ASC)`.
#[derive(Debug, Clone, Default)]
pub struct ReadQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Composite resume cursor: strictly after `(received_at, event_id)`.
    pub after: Option<ProjectionCursor>,
    /// Restrict to these event types (empty = all).
    pub event_types: Vec<String>,
    /// Page size; `None` reads to the end.
    pub limit: Option<usize>,
}

/// Append-only, hash-chained event store.
pub trait EventStore: Send + Sync {
    /// Append a batch atomically.
    ///
    /// All events must carry `business_id`; the first event must chain
    /// to the current tip (or `GENESIS`), subsequent events to their
    /// predecessor within the batch. A resubmission of an identical,
    /// already-stored batch returns the stored records unchanged.
    fn append(
        &self,
        business_id: BusinessId,
        events: Vec<ChainedEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Hash of the last event of the business chain, if any.
    fn chain_tip(&self, business_id: BusinessId) -> Result<Option<String>, EventStoreError>;

    /// Read events for one business in deterministic order.
    fn read(
        &self,
        business_id: BusinessId,
        query: &ReadQuery,
    ) -> Result<Vec<EventRecord>, EventStoreError>;

    /// Fetch a single event by id within the tenant boundary.
    fn get_by_event_id(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError>;

    /// Recompute every hash in the business chain and verify the
    /// links. Returns the number of verified events.
    fn verify_chain(&self, business_id: BusinessId) -> Result<usize, EventStoreError>;

    /// Every business with at least one stored event (sorted).
    fn businesses(&self) -> Result<Vec<BusinessId>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        business_id: BusinessId,
        events: Vec<ChainedEvent>,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).append(business_id, events)
    }

    fn chain_tip(&self, business_id: BusinessId) -> Result<Option<String>, EventStoreError> {
        (**self).chain_tip(business_id)
    }

    fn read(
        &self,
        business_id: BusinessId,
        query: &ReadQuery,
    ) -> Result<Vec<EventRecord>, EventStoreError> {
        (**self).read(business_id, query)
    }

    fn get_by_event_id(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        (**self).get_by_event_id(business_id, event_id)
    }

    fn verify_chain(&self, business_id: BusinessId) -> Result<usize, EventStoreError> {
        (**self).verify_chain(business_id)
    }

    fn businesses(&self) -> Result<Vec<BusinessId>, EventStoreError> {
        (**self).businesses()
    }
}
