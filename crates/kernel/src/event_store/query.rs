//! Async event query interface for inspection and adapters.
//!
//! Read-only, tenant-scoped, paginated. The synchronous `EventStore`
//! trait is the write path; this surface exists for adapters and
//! operational tooling that run on an async runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bos_core::{BusinessId, EventId};
use bos_events::EventRecord;

use super::r#trait::{EventStore, EventStoreError, ReadQuery};

/// Pagination parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for event queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub source_engine: Option<String>,
    pub correlation_id: Option<uuid::Uuid>,
    pub received_after: Option<DateTime<Utc>>,
    pub received_before: Option<DateTime<Utc>>,
}

/// Paginated query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueryResult {
    pub events: Vec<EventRecord>,
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

/// Async, read-only query surface over a store.
#[async_trait]
pub trait EventQuery: Send + Sync {
    /// Query events for a tenant, ordered `(received_at, event_id)`.
    async fn query_events(
        &self,
        business_id: BusinessId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError>;

    /// Fetch a single event within the tenant boundary.
    async fn get_event(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError>;
}

/// Blanket implementation for synchronous stores: filter in memory.
#[async_trait]
impl<S> EventQuery for S
where
    S: EventStore + Sync,
{
    async fn query_events(
        &self,
        business_id: BusinessId,
        filter: EventFilter,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let read = ReadQuery {
            since: filter.received_after,
            until: filter.received_before,
            ..Default::default()
        };
        let all = self.read(business_id, &read)?;

        let filtered: Vec<EventRecord> = all
            .into_iter()
            .filter(|r| {
                filter
                    .event_type
                    .as_deref()
                    .is_none_or(|t| r.event_type == t)
            })
            .filter(|r| {
                filter
                    .source_engine
                    .as_deref()
                    .is_none_or(|e| r.source_engine == e)
            })
            .filter(|r| {
                filter
                    .correlation_id
                    .is_none_or(|c| *r.correlation_id.as_uuid() == c)
            })
            .collect();

        let total = filtered.len() as u64;
        let events: Vec<EventRecord> = filtered
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);

        Ok(EventQueryResult {
            events,
            total,
            pagination,
            has_more,
        })
    }

    async fn get_event(
        &self,
        business_id: BusinessId,
        event_id: EventId,
    ) -> Result<Option<EventRecord>, EventStoreError> {
        self.get_by_event_id(business_id, event_id)
    }
}
