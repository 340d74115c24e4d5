//! Canonical event record — the sole unit of truth.
//!
//! Once persisted, an event is never modified or deleted. Corrections
//! are new events with `correction_of` set. The chain within one
//! business is strictly linear: each record's `previous_event_hash`
//! equals the prior record's `event_hash`, and the first record links
//! to the `GENESIS` sentinel.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use bos_core::{ActorType, BranchId, BusinessId, CorrelationId, EventId};

use crate::canonical::{compute_event_hash, CanonicalError};

/// Event lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    /// Confirmed, immutable, fully trusted.
    Final,
    /// Created offline or pending sync; awaits confirmation.
    Provisional,
    /// Requires human review (conflict, variance, AI advice).
    ReviewRequired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Final => "FINAL",
            EventStatus::Provisional => "PROVISIONAL",
            EventStatus::ReviewRequired => "REVIEW_REQUIRED",
        }
    }
}

/// Optional pointer to an external object (receipt, PO number, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub object_type: String,
    pub object_id: String,
}

/// Timestamp rendering used in stable headers and on the wire.
///
/// RFC3339 UTC with microsecond precision and a `Z` suffix; fixed so
/// that header canonicalization is byte-stable.
pub fn format_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A handler-produced event that has not yet been chained or stored.
///
/// Carries everything except the fields the write path assigns:
/// `received_at`, `previous_event_hash`, `event_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub event_version: u32,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub source_engine: String,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub payload: JsonValue,
    pub reference: Option<Reference>,
    pub created_at: DateTime<Utc>,
    pub status: EventStatus,
    pub correction_of: Option<EventId>,
}

impl CandidateEvent {
    /// The stable header object included in the hash input.
    ///
    /// Optional fields render as `null` here (the header always has a
    /// fixed key set, unlike payloads where absence is meaningful).
    pub fn stable_header(&self) -> JsonValue {
        json!({
            "branch_id": self.branch_id.map(|b| b.to_string()),
            "business_id": self.business_id.to_string(),
            "causation_id": self.causation_id.map(|c| c.to_string()),
            "correction_of": self.correction_of.map(|c| c.to_string()),
            "correlation_id": self.correlation_id.to_string(),
            "created_at": format_rfc3339(self.created_at),
            "event_id": self.event_id.to_string(),
            "event_type": self.event_type,
            "event_version": self.event_version,
            "status": self.status.as_str(),
        })
    }

    /// Compute this event's chain hash against the given predecessor.
    pub fn chain_hash(&self, previous_event_hash: &str) -> Result<String, CanonicalError> {
        compute_event_hash(&self.payload, previous_event_hash, &self.stable_header())
    }

    /// Seal the candidate into a full record with store-assigned fields.
    pub fn into_record(
        self,
        received_at: DateTime<Utc>,
        previous_event_hash: String,
        event_hash: String,
    ) -> EventRecord {
        EventRecord {
            event_id: self.event_id,
            event_type: self.event_type,
            event_version: self.event_version,
            business_id: self.business_id,
            branch_id: self.branch_id,
            source_engine: self.source_engine,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: self.payload,
            reference: self.reference,
            created_at: self.created_at,
            received_at,
            status: self.status,
            correction_of: self.correction_of,
            previous_event_hash,
            event_hash,
        }
    }
}

/// A persisted, immutable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub event_version: u32,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub source_engine: String,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub payload: JsonValue,
    pub reference: Option<Reference>,
    pub created_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub status: EventStatus,
    pub correction_of: Option<EventId>,
    pub previous_event_hash: String,
    pub event_hash: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HashVerifyError {
    #[error("hash mismatch for event {event_id}: stored {stored}, computed {computed}")]
    Mismatch {
        event_id: EventId,
        stored: String,
        computed: String,
    },

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

impl EventRecord {
    /// Composite store cursor position of this record.
    pub fn cursor(&self) -> (DateTime<Utc>, EventId) {
        (self.received_at, self.event_id)
    }

    /// Whether this is the first event of its business chain.
    pub fn is_genesis(&self) -> bool {
        self.previous_event_hash == crate::canonical::GENESIS_HASH
    }

    fn as_candidate_header(&self) -> JsonValue {
        json!({
            "branch_id": self.branch_id.map(|b| b.to_string()),
            "business_id": self.business_id.to_string(),
            "causation_id": self.causation_id.map(|c| c.to_string()),
            "correction_of": self.correction_of.map(|c| c.to_string()),
            "correlation_id": self.correlation_id.to_string(),
            "created_at": format_rfc3339(self.created_at),
            "event_id": self.event_id.to_string(),
            "event_type": self.event_type,
            "event_version": self.event_version,
            "status": self.status.as_str(),
        })
    }

    /// Recompute this record's hash and compare against the stored one.
    pub fn verify_hash(&self) -> Result<(), HashVerifyError> {
        let computed = compute_event_hash(
            &self.payload,
            &self.previous_event_hash,
            &self.as_candidate_header(),
        )?;
        if computed != self.event_hash {
            return Err(HashVerifyError::Mismatch {
                event_id: self.event_id,
                stored: self.event_hash.clone(),
                computed,
            });
        }
        Ok(())
    }
}
