//! Event store backends and the store contract.

mod in_memory;
mod postgres;
mod query;
mod r#trait;

pub use in_memory::MemoryEventStore;
pub use postgres::{PostgresEventStore, EVENTS_TABLE_DDL};
pub use query::{EventFilter, EventQuery, EventQueryResult, Pagination};
pub use r#trait::{ChainedEvent, EventStore, EventStoreError, ReadQuery};
