//! Command bus — the single lawful write path.
//!
//! Every mutation flows through `handle`, in this exact order:
//! resolve handler, enforce deadline, take the tenant write lock,
//! check command idempotency, run the guard pipeline, invoke the pure
//! engine handler, chain and hash the candidate events, append
//! atomically, fold projections, then (outside the lock) fan out to
//! subscribers. Rejections are structured, optionally recorded as
//! events, and never silent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use bos_core::{
    BusinessContext, BusinessId, Clock, CorrelationId, EventId, Rejection, RejectionCode,
};
use bos_events::{
    canonical_json, CandidateEvent, CommandEnvelope, EventRecord, EventStatus, EventTypeRegistry,
    Outcome, Reference, RegistryError, SubscriberRegistry, COMMAND_TYPE_MIN_SEGMENTS,
    COMMAND_TYPE_SUFFIX, GENESIS_HASH,
};
use bos_policy::{CommandPolicy, GuardInput, GuardPipeline, ResilienceMode};

use crate::event_store::{ChainedEvent, EventStore};
use crate::projections::{ProjectionRuntime, ProjectionView, RuntimeError};
use crate::state::{LifecycleProjection, ResilienceProjection};

/// Event type for recorded rejections.
pub const REJECTION_RECORDED: &str = "rejection.recorded.v1";

/// A handler-produced event before the bus fills in envelope fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: String,
    pub payload: JsonValue,
    pub status: EventStatus,
    pub reference: Option<Reference>,
    pub causation_id: Option<EventId>,
    pub correction_of: Option<EventId>,
    /// Explicit id for handler-level idempotency; bus-assigned when
    /// absent.
    pub event_id: Option<EventId>,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            status: EventStatus::Final,
            reference: None,
            causation_id: None,
            correction_of: None,
            event_id: None,
        }
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_correction_of(mut self, corrected: EventId) -> Self {
        self.correction_of = Some(corrected);
        self
    }
}

/// Context handed to engine handlers.
///
/// Handlers are pure over `(command, view, clock)`: no wall-clock
/// reads, no randomness, no external IO, no calls into other engines.
pub struct HandlerContext<'a> {
    pub context: &'a BusinessContext,
    pub clock: &'a dyn Clock,
}

/// An engine command handler.
pub trait CommandHandler: Send + Sync {
    fn handle(
        &self,
        command: &CommandEnvelope,
        view: &ProjectionView<'_>,
        ctx: &HandlerContext<'_>,
    ) -> Result<Vec<EventDraft>, Rejection>;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandEnvelope, &ProjectionView<'_>, &HandlerContext<'_>) -> Result<Vec<EventDraft>, Rejection>
        + Send
        + Sync,
{
    fn handle(
        &self,
        command: &CommandEnvelope,
        view: &ProjectionView<'_>,
        ctx: &HandlerContext<'_>,
    ) -> Result<Vec<EventDraft>, Rejection> {
        self(command, view, ctx)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("command type '{0}' does not follow engine.domain.action.request format")]
    InvalidCommandType(String),

    #[error("command type '{0}' already has a handler")]
    DuplicateCommand(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

struct CommandRegistration {
    policy: CommandPolicy,
    handler: Arc<dyn CommandHandler>,
}

struct IdempotencyEntry {
    fingerprint: String,
    outcome: Outcome,
}

/// Per-business rejection-recording configuration.
#[derive(Debug)]
struct RecordingConfig {
    default_enabled: bool,
    overrides: HashMap<BusinessId, bool>,
}

/// Per-tenant write locks: the bus is parallel across tenants and a
/// single writer per tenant.
#[derive(Debug, Default)]
pub struct TenantLocks {
    locks: Mutex<HashMap<BusinessId, Arc<Mutex<()>>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_business(&self, business_id: BusinessId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(business_id).or_default())
    }
}

/// The command bus.
pub struct CommandBus<S: EventStore> {
    store: Arc<S>,
    registry: Arc<EventTypeRegistry>,
    subscribers: Arc<SubscriberRegistry>,
    guards: GuardPipeline,
    lifecycle: Arc<LifecycleProjection>,
    resilience: Arc<ResilienceProjection>,
    handlers: RwLock<HashMap<String, CommandRegistration>>,
    runtime: Mutex<ProjectionRuntime>,
    locks: Arc<TenantLocks>,
    clock: Arc<dyn Clock>,
    recording: Mutex<RecordingConfig>,
    idempotency: Mutex<HashMap<(BusinessId, String), IdempotencyEntry>>,
}

impl<S: EventStore> CommandBus<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        registry: Arc<EventTypeRegistry>,
        subscribers: Arc<SubscriberRegistry>,
        guards: GuardPipeline,
        lifecycle: Arc<LifecycleProjection>,
        resilience: Arc<ResilienceProjection>,
        runtime: ProjectionRuntime,
        locks: Arc<TenantLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            subscribers,
            guards,
            lifecycle,
            resilience,
            handlers: RwLock::new(HashMap::new()),
            runtime: Mutex::new(runtime),
            locks,
            clock,
            recording: Mutex::new(RecordingConfig {
                default_enabled: true,
                overrides: HashMap::new(),
            }),
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<EventTypeRegistry> {
        &self.registry
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tenant_locks(&self) -> &Arc<TenantLocks> {
        &self.locks
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Configure rejection-event recording for one business.
    pub fn set_rejection_recording(&self, business_id: BusinessId, enabled: bool) {
        self.recording
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .overrides
            .insert(business_id, enabled);
    }

    fn recording_enabled(&self, business_id: BusinessId) -> bool {
        let recording = self.recording.lock().unwrap_or_else(|e| e.into_inner());
        recording
            .overrides
            .get(&business_id)
            .copied()
            .unwrap_or(recording.default_enabled)
    }

    /// Register a command type with its declared policy and handler.
    pub fn register_command(
        &self,
        command_type: &str,
        policy: CommandPolicy,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), BusError> {
        let segments: Vec<&str> = command_type.split('.').collect();
        if !command_type.ends_with(COMMAND_TYPE_SUFFIX)
            || segments.len() < COMMAND_TYPE_MIN_SEGMENTS
            || segments.iter().any(|s| s.is_empty())
        {
            return Err(BusError::InvalidCommandType(command_type.to_string()));
        }

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(command_type) {
            return Err(BusError::DuplicateCommand(command_type.to_string()));
        }
        handlers.insert(
            command_type.to_string(),
            CommandRegistration { policy, handler },
        );
        tracing::debug!(command_type, "command handler registered");
        Ok(())
    }

    /// Register a projection into the runtime.
    pub fn register_projection(
        &self,
        projection: Box<dyn bos_events::Projection>,
    ) -> Result<(), BusError> {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        runtime.register(projection)?;
        Ok(())
    }

    /// Run a closure against the projection runtime (read-only).
    pub fn with_view<R>(&self, f: impl FnOnce(&ProjectionView<'_>) -> R) -> R {
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        f(&runtime.view())
    }

    /// Run a closure against the runtime mutably (replay path only).
    pub fn with_runtime_mut<R>(&self, f: impl FnOnce(&mut ProjectionRuntime) -> R) -> R {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut runtime)
    }

    /// Handle one command end to end.
    pub fn handle(&self, command: &CommandEnvelope) -> Outcome {
        let outcome = self.execute(command);

        // Post-commit fan-out: after the tenant lock is released, and
        // never affecting the committed outcome.
        if let Outcome::Accepted { events } = &outcome {
            if !events.is_empty() {
                let report = self.subscribers.dispatch(events);
                if report.failed > 0 {
                    tracing::warn!(
                        failed = report.failed,
                        notified = report.notified,
                        "subscriber failures after commit"
                    );
                }
            }
        }

        outcome
    }

    fn execute(&self, command: &CommandEnvelope) -> Outcome {
        let correlation_id = command.correlation_id.unwrap_or_default();

        // Phase boundary 1: deadline before any work.
        if let Some(rejection) = self.deadline_exceeded(command) {
            return Outcome::rejected(rejection);
        }

        // Single writer per tenant from here on. Taken before the
        // handler lookup so that even unknown-command rejection events
        // append under the lock.
        let lock = self.locks.for_business(command.business_id);
        let _tenant = lock.lock().unwrap_or_else(|e| e.into_inner());

        let Some((policy, handler)) = self.registration_of(&command.command_type) else {
            let rejection = Rejection::new(
                RejectionCode::UnknownCommand,
                format!("no handler registered for '{}'", command.command_type),
                "command_bus",
            );
            return self.finish_rejected(command, rejection, self.clock.now_utc());
        };

        // Command idempotency: an identical resubmission returns the
        // stored outcome unchanged.
        if let Some(key) = &command.idempotency_key {
            let fingerprint = command_fingerprint(command);
            let idempotency = self.idempotency.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = idempotency.get(&(command.business_id, key.clone())) {
                if entry.fingerprint == fingerprint {
                    tracing::debug!(command_id = %command.command_id, "idempotent command replay");
                    return entry.outcome.clone();
                }
                return Outcome::rejected(Rejection::new(
                    RejectionCode::DuplicateRequest,
                    "idempotency key was already used by a different command",
                    "command_bus",
                ));
            }
        }

        let now = self.clock.now_utc();
        let input = GuardInput {
            command,
            policy: &policy,
            now,
        };
        let trail = match self.guards.evaluate(&input) {
            Ok(trail) => trail,
            Err(rejection) => {
                tracing::info!(
                    command_id = %command.command_id,
                    code = %rejection.code,
                    policy = %rejection.policy_name,
                    "command rejected by guard"
                );
                return self.finish_rejected(command, rejection, now);
            }
        };
        if !trail.compliance_warnings.is_empty() {
            tracing::warn!(
                command_id = %command.command_id,
                warnings = trail.compliance_warnings.len(),
                "compliance warnings on accepted command"
            );
        }
        for advisory in &trail.anomaly_advisories {
            tracing::warn!(command_id = %command.command_id, %advisory, "anomaly advisory");
        }

        let context = self.build_context(command, correlation_id);

        // Handler: pure over (command, view, clock). The runtime lock
        // is held only for the duration of the call.
        let handled = {
            let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
            let view = runtime.view();
            let ctx = HandlerContext {
                context: &context,
                clock: self.clock.as_ref(),
            };
            handler.handle(command, &view, &ctx)
        };
        let drafts = match handled {
            Ok(drafts) => drafts,
            Err(rejection) => return self.finish_rejected(command, rejection, now),
        };

        let candidates = match self.seal_drafts(command, correlation_id, drafts, now) {
            Ok(candidates) => candidates,
            Err(rejection) => return self.finish_rejected(command, rejection, now),
        };

        // Phase boundary 2: deadline before the append; once appended
        // the events are durable and cancellation is a no-op.
        if let Some(rejection) = self.deadline_exceeded(command) {
            return self.finish_rejected(command, rejection, now);
        }

        let committed = match self.chain_and_append(command.business_id, candidates) {
            Ok(committed) => committed,
            Err(rejection) => return self.finish_rejected(command, rejection, now),
        };

        {
            let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
            runtime.apply_committed(&committed);
        }

        self.guards.record_activity(command, now, false);
        let outcome = Outcome::accepted(committed);
        self.remember_outcome(command, &outcome);
        outcome
    }

    fn registration_of(
        &self,
        command_type: &str,
    ) -> Option<(CommandPolicy, Arc<dyn CommandHandler>)> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(command_type)
            .map(|registration| (registration.policy.clone(), Arc::clone(&registration.handler)))
    }

    fn deadline_exceeded(&self, command: &CommandEnvelope) -> Option<Rejection> {
        let deadline = command.deadline?;
        let now = self.clock.now_utc();
        if now <= deadline {
            return None;
        }
        Some(
            Rejection::guard_internal(
                "deadline_guard",
                "command deadline exceeded before commit",
            )
            .with_details(json!({
                "deadline": deadline.to_rfc3339(),
                "observed": now.to_rfc3339(),
            })),
        )
    }

    fn build_context(
        &self,
        command: &CommandEnvelope,
        correlation_id: CorrelationId,
    ) -> BusinessContext {
        let mut context = BusinessContext::new(command.business_id, correlation_id)
            .with_lifecycle(self.lifecycle.state_of(command.business_id));
        if let Some(branch_id) = command.branch_id {
            context = context.with_branch(branch_id);
        }
        if let Some(actor) = &command.actor_context {
            context = context.with_actor(actor.clone());
        }
        context
    }

    /// Turn handler drafts into fully-addressed candidate events.
    fn seal_drafts(
        &self,
        command: &CommandEnvelope,
        correlation_id: CorrelationId,
        drafts: Vec<EventDraft>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CandidateEvent>, Rejection> {
        let mut candidates = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let version = match self.registry.version_of(&draft.event_type) {
                Some(version) => version,
                None => {
                    return Err(Rejection::new(
                        RejectionCode::UnknownEventType,
                        format!("event type '{}' is not registered", draft.event_type),
                        "event_type_registry",
                    ))
                }
            };
            if let Err(err) = self.registry.validate_payload(&draft.event_type, &draft.payload) {
                let rejection = match err {
                    RegistryError::Unknown(event_type) => Rejection::new(
                        RejectionCode::UnknownEventType,
                        format!("event type '{event_type}' is not registered"),
                        "event_type_registry",
                    ),
                    other => Rejection::new(
                        RejectionCode::InvalidCommandStructure,
                        other.to_string(),
                        "event_type_registry",
                    ),
                };
                return Err(rejection);
            }

            candidates.push(CandidateEvent {
                event_id: draft.event_id.unwrap_or_default(),
                event_type: draft.event_type,
                event_version: version,
                business_id: command.business_id,
                branch_id: command.branch_id,
                source_engine: command.source_engine.clone(),
                actor_type: command.actor_type,
                actor_id: command.actor_id.clone(),
                correlation_id,
                causation_id: draft.causation_id,
                payload: draft.payload,
                reference: draft.reference,
                created_at: now,
                status: draft.status,
                correction_of: draft.correction_of,
            });
        }
        Ok(candidates)
    }

    /// Compute the chain links from the current tip and append.
    fn chain_and_append(
        &self,
        business_id: BusinessId,
        candidates: Vec<CandidateEvent>,
    ) -> Result<Vec<EventRecord>, Rejection> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let tip = self
            .store
            .chain_tip(business_id)
            .map_err(|e| e.to_rejection())?
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        let mut previous = tip;
        let mut chained = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let event = ChainedEvent::seal(candidate, previous.clone()).map_err(|e| {
                Rejection::new(
                    RejectionCode::InvalidCommandStructure,
                    format!("payload is not canonically encodable: {e}"),
                    "canonical_encoder",
                )
            })?;
            previous = event.event_hash.clone();
            chained.push(event);
        }

        self.store
            .append(business_id, chained)
            .map_err(|e| e.to_rejection())
    }

    fn remember_outcome(&self, command: &CommandEnvelope, outcome: &Outcome) {
        let Some(key) = &command.idempotency_key else {
            return;
        };
        self.idempotency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                (command.business_id, key.clone()),
                IdempotencyEntry {
                    fingerprint: command_fingerprint(command),
                    outcome: outcome.clone(),
                },
            );
    }

    /// Shared tail for every rejection path: record activity, emit
    /// the optional rejection event, remember the outcome.
    fn finish_rejected(
        &self,
        command: &CommandEnvelope,
        rejection: Rejection,
        now: DateTime<Utc>,
    ) -> Outcome {
        self.guards.record_activity(command, now, true);
        self.record_rejection_event(command, &rejection, now);
        let outcome = Outcome::rejected(rejection);
        self.remember_outcome(command, &outcome);
        outcome
    }

    /// Persist a `rejection.recorded.v1` event so denials are
    /// themselves auditable. Recording is per-business configuration
    /// and suppressed outside NORMAL mode (it is itself a write).
    fn record_rejection_event(
        &self,
        command: &CommandEnvelope,
        rejection: &Rejection,
        now: DateTime<Utc>,
    ) {
        if !self.recording_enabled(command.business_id) {
            return;
        }
        if self.resilience.mode_of(command.business_id) != ResilienceMode::Normal {
            return;
        }

        let candidate = CandidateEvent {
            event_id: EventId::new(),
            event_type: REJECTION_RECORDED.to_string(),
            event_version: 1,
            business_id: command.business_id,
            branch_id: command.branch_id,
            source_engine: "rejection".to_string(),
            actor_type: command.actor_type,
            actor_id: command.actor_id.clone(),
            correlation_id: command.correlation_id.unwrap_or_default(),
            causation_id: None,
            payload: json!({
                "command_id": command.command_id.to_string(),
                "command_type": command.command_type,
                "rejection": rejection,
                "original_payload": command.payload,
            }),
            reference: None,
            created_at: now,
            status: EventStatus::Final,
            correction_of: None,
        };

        match self.chain_and_append(command.business_id, vec![candidate]) {
            Ok(committed) => {
                let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
                runtime.apply_committed(&committed);
            }
            Err(err) => {
                tracing::warn!(
                    command_id = %command.command_id,
                    error = %err,
                    "failed to record rejection event"
                );
            }
        }
    }
}

impl<S: EventStore> core::fmt::Debug for CommandBus<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("CommandBus")
            .field("commands", &handlers.len())
            .finish()
    }
}

/// Stable fingerprint of a command for idempotency-key comparison.
fn command_fingerprint(command: &CommandEnvelope) -> String {
    let body = json!({
        "command_type": command.command_type,
        "business_id": command.business_id.to_string(),
        "branch_id": command.branch_id.map(|b| b.to_string()),
        "payload": command.payload,
    });
    canonical_json(&body).unwrap_or_else(|_| command.command_id.to_string())
}
