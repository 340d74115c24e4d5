//! `bos-events` — event-sourcing mechanics.
//!
//! This crate defines **mechanics**, not business logic: the canonical
//! serializer and hash chain, the event and command envelopes, the
//! binary outcome, the event type registry, the projection contract,
//! and the post-commit subscriber bus. Events are immutable,
//! versioned, and append-only; tenancy is enforced at the record
//! level (`business_id` is mandatory).

pub mod canonical;
pub mod command;
pub mod outcome;
pub mod projection;
pub mod record;
pub mod registry;
pub mod subscriber;

pub use canonical::{canonical_json, compute_event_hash, CanonicalError, GENESIS_HASH};
pub use command::{CommandEnvelope, COMMAND_TYPE_MIN_SEGMENTS, COMMAND_TYPE_SUFFIX};
pub use outcome::Outcome;
pub use projection::{Projection, ProjectionCursor, ProjectionError};
pub use record::{CandidateEvent, EventRecord, EventStatus, HashVerifyError, Reference};
pub use registry::{parse_event_type, EventTypeRegistry, PayloadValidator, RegistryError};
pub use subscriber::{
    DispatchFailure, DispatchReport, Subscriber, SubscriberBusError, SubscriberError,
    SubscriberRegistry,
};
