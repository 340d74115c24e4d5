//! `bos-kernel` — the deterministic, multi-tenant, event-sourced core.
//!
//! Business intents enter as commands; the bus validates, guards,
//! executes, chains, and appends them as immutable hash-chained
//! events, from which all state is derived. This crate composes the
//! infrastructure: event store backends, the command bus, the
//! projection runtime, replay and snapshots, the administrative
//! surface, and the audit journal.

pub mod admin;
pub mod audit;
pub mod bus;
pub mod event_store;
pub mod kernel;
pub mod projections;
pub mod replay;
pub mod replay_gate;
pub mod snapshots;
pub mod state;

#[cfg(test)]
mod integration_tests;

pub use audit::{
    AuditEntry, AuditJournal, AuditStatus, ConsentRecord, ConsentType, DecisionEntry,
    DecisionMode, DecisionOutcome,
};
pub use bus::{
    BusError, CommandBus, CommandHandler, EventDraft, HandlerContext, TenantLocks,
    REJECTION_RECORDED,
};
pub use event_store::{
    ChainedEvent, EventFilter, EventQuery, EventQueryResult, EventStore, EventStoreError,
    MemoryEventStore, Pagination, PostgresEventStore, ReadQuery,
};
pub use kernel::{Engine, EngineRegistrar, Kernel, KernelError};
pub use projections::{ProjectionRuntime, ProjectionView, RuntimeError};
pub use replay::{CheckpointStore, ReplayEngine, ReplayError, ReplayOptions, ReplayReport, ReplayScope};
pub use replay_gate::{ReplayGate, ReplayLease};
pub use snapshots::{MemorySnapshotStore, SnapshotRecord, SnapshotStore};
pub use state::KernelState;
