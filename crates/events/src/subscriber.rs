//! Subscriber bus — post-commit fan-out.
//!
//! Truth must exist before it is heard: dispatch happens only after a
//! successful append, and a failing subscriber can never roll back
//! the committed log or starve its peers. Dispatch is sequential and
//! deterministic; it is skipped entirely during replay.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::record::EventRecord;

/// A post-commit event consumer.
///
/// Subscribers receive read-only event views. They may issue new
/// commands back through the bus they captured at construction, but
/// they must not mutate engine state directly.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, record: &EventRecord) -> Result<(), SubscriberError>;
}

impl<F> Subscriber for F
where
    F: Fn(&EventRecord) -> Result<(), SubscriberError> + Send + Sync,
{
    fn on_event(&self, record: &EventRecord) -> Result<(), SubscriberError> {
        self(record)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("subscriber failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriberBusError {
    #[error("event type '{0}' does not follow engine.domain.action format")]
    InvalidEventTypeFormat(String),

    #[error("engine '{engine}' may not subscribe to its own event type '{event_type}'")]
    SelfSubscription { engine: String, event_type: String },

    #[error("subscriber '{name}' is already registered for '{event_type}'")]
    DuplicateSubscriber { name: String, event_type: String },
}

struct Entry {
    engine: String,
    name: String,
    handler: Arc<dyn Subscriber>,
}

/// One failed handler invocation in a dispatch round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub event_type: String,
    pub subscriber: String,
    pub engine: String,
    pub error: SubscriberError,
}

/// Result of dispatching a batch of committed events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub notified: usize,
    pub failed: usize,
    pub failures: Vec<DispatchFailure>,
}

/// In-memory registry of event subscribers.
///
/// Not to be confused with the event type registry: that one controls
/// what can be persisted, this one controls who listens.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<String, Vec<Entry>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type.
    ///
    /// Self-subscription (an engine listening to its own namespace)
    /// is rejected unless explicitly whitelisted.
    pub fn register(
        &self,
        event_type: &str,
        subscriber_engine: &str,
        name: &str,
        handler: Arc<dyn Subscriber>,
        allow_self_subscription: bool,
    ) -> Result<(), SubscriberBusError> {
        let parts: Vec<&str> = event_type.split('.').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(SubscriberBusError::InvalidEventTypeFormat(
                event_type.to_string(),
            ));
        }

        let source_engine = parts[0];
        if source_engine == subscriber_engine && !allow_self_subscription {
            return Err(SubscriberBusError::SelfSubscription {
                engine: subscriber_engine.to_string(),
                event_type: event_type.to_string(),
            });
        }

        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let entries = subscribers.entry(event_type.to_string()).or_default();
        if entries.iter().any(|e| e.name == name) {
            return Err(SubscriberBusError::DuplicateSubscriber {
                name: name.to_string(),
                event_type: event_type.to_string(),
            });
        }

        tracing::debug!(event_type, subscriber = name, engine = subscriber_engine, "subscriber registered");
        entries.push(Entry {
            engine: subscriber_engine.to_string(),
            name: name.to_string(),
            handler: Arc::clone(&handler),
        });
        Ok(())
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Dispatch one batch of committed events.
    ///
    /// Events are delivered in `(event_type, received_at, event_id)`
    /// order, handlers per event in `(engine, name)` order. Handler
    /// errors are caught, logged, and reported; they never propagate.
    pub fn dispatch(&self, events: &[EventRecord]) -> DispatchReport {
        let mut ordered: Vec<&EventRecord> = events.iter().collect();
        ordered.sort_by(|a, b| {
            (&a.event_type, a.received_at, a.event_id)
                .cmp(&(&b.event_type, b.received_at, b.event_id))
        });

        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut report = DispatchReport::default();

        for record in ordered {
            let Some(entries) = subscribers.get(&record.event_type) else {
                tracing::debug!(event_type = %record.event_type, "no subscribers");
                continue;
            };

            let mut handlers: Vec<&Entry> = entries.iter().collect();
            handlers.sort_by(|a, b| (&a.engine, &a.name).cmp(&(&b.engine, &b.name)));

            for entry in handlers {
                match entry.handler.on_event(record) {
                    Ok(()) => report.notified += 1,
                    Err(error) => {
                        tracing::error!(
                            event_type = %record.event_type,
                            event_id = %record.event_id,
                            subscriber = %entry.name,
                            %error,
                            "subscriber failed; continuing dispatch"
                        );
                        report.failed += 1;
                        report.failures.push(DispatchFailure {
                            event_type: record.event_type.clone(),
                            subscriber: entry.name.clone(),
                            engine: entry.engine.clone(),
                            error,
                        });
                    }
                }
            }
        }

        report
    }
}

impl core::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("SubscriberRegistry")
            .field("event_types", &subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bos_core::{ActorType, BusinessId, CorrelationId, EventId};
    use crate::canonical::GENESIS_HASH;
    use crate::record::{CandidateEvent, EventStatus};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn record(event_type: &str) -> EventRecord {
        let candidate = CandidateEvent {
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            event_version: 1,
            business_id: BusinessId::new(),
            branch_id: None,
            source_engine: event_type.split('.').next().unwrap().to_string(),
            actor_type: ActorType::System,
            actor_id: "sys".to_string(),
            correlation_id: CorrelationId::new(),
            causation_id: None,
            payload: serde_json::json!({}),
            reference: None,
            created_at: Utc::now(),
            status: EventStatus::Final,
            correction_of: None,
        };
        let hash = candidate.chain_hash(GENESIS_HASH).unwrap();
        candidate.into_record(Utc::now(), GENESIS_HASH.to_string(), hash)
    }

    #[test]
    fn self_subscription_is_rejected_unless_whitelisted() {
        let registry = SubscriberRegistry::new();
        let handler: Arc<dyn Subscriber> =
            Arc::new(|_: &EventRecord| -> Result<(), SubscriberError> { Ok(()) });

        let err = registry
            .register("inventory.stock.moved.v1", "inventory", "s1", Arc::clone(&handler), false)
            .unwrap_err();
        assert!(matches!(err, SubscriberBusError::SelfSubscription { .. }));

        registry
            .register("inventory.stock.moved.v1", "inventory", "s1", handler, true)
            .unwrap();
    }

    #[test]
    fn duplicate_subscriber_is_rejected() {
        let registry = SubscriberRegistry::new();
        let handler: Arc<dyn Subscriber> =
            Arc::new(|_: &EventRecord| -> Result<(), SubscriberError> { Ok(()) });
        registry
            .register("inventory.stock.moved.v1", "accounting", "ledger", Arc::clone(&handler), false)
            .unwrap();
        let err = registry
            .register("inventory.stock.moved.v1", "accounting", "ledger", handler, false)
            .unwrap_err();
        assert!(matches!(err, SubscriberBusError::DuplicateSubscriber { .. }));
    }

    #[test]
    fn failing_subscriber_does_not_affect_peers() {
        let registry = SubscriberRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counting = Arc::clone(&calls);
        registry
            .register(
                "cash.drawer.opened.v1",
                "accounting",
                "b-counter",
                Arc::new(move |_: &EventRecord| -> Result<(), SubscriberError> {
                    counting.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
                false,
            )
            .unwrap();
        registry
            .register(
                "cash.drawer.opened.v1",
                "accounting",
                "a-failing",
                Arc::new(|_: &EventRecord| -> Result<(), SubscriberError> {
                    Err(SubscriberError::Failed("boom".to_string()))
                }),
                false,
            )
            .unwrap();

        let report = registry.dispatch(&[record("cash.drawer.opened.v1")]);
        assert_eq!(report.notified, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.failures[0].subscriber, "a-failing");
    }

    #[test]
    fn dispatch_order_is_type_sorted() {
        let registry = SubscriberRegistry::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for event_type in ["retail.sale.completed.v1", "cash.drawer.opened.v1"] {
            let sink = Arc::clone(&seen);
            registry
                .register(
                    event_type,
                    "accounting",
                    "recorder",
                    Arc::new(move |r: &EventRecord| -> Result<(), SubscriberError> {
                        sink.lock().unwrap().push(r.event_type.clone());
                        Ok(())
                    }),
                    false,
                )
                .unwrap();
        }

        // Submitted out of type order; dispatch sorts by type first.
        registry.dispatch(&[
            record("retail.sale.completed.v1"),
            record("cash.drawer.opened.v1"),
        ]);

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            ["cash.drawer.opened.v1", "retail.sale.completed.v1"]
        );
    }
}
