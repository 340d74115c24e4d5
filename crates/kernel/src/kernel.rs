//! Kernel assembly.
//!
//! Wires the store, registry, guard pipeline, kernel state
//! projections, command bus, replay engine, snapshot store, and audit
//! journal into one unit, and exposes the engine plug-in contract.
//! Tests instantiate a fresh kernel per test; nothing here is a
//! process global.

use std::sync::Arc;

use thiserror::Error;

use bos_core::{BusinessId, Clock};
use bos_events::{
    CommandEnvelope, EventTypeRegistry, Outcome, PayloadValidator, Projection, ProjectionCursor,
    RegistryError, Subscriber, SubscriberBusError, SubscriberRegistry,
};
use bos_policy::{
    AnomalyDetector, AnomalyThresholds, CommandPolicy, GuardPipeline, RateLimitTiers, RateLimiter,
};

use crate::admin::{self, InstallError};
use crate::audit::{AuditEntry, AuditJournal, AuditStatus};
use crate::bus::{BusError, CommandBus, CommandHandler, TenantLocks};
use crate::event_store::{EventStore, MemoryEventStore};
use crate::projections::{ProjectionRuntime, RuntimeError};
use crate::replay::{ReplayEngine, ReplayError, ReplayOptions, ReplayReport, ReplayScope};
use crate::replay_gate::ReplayGate;
use crate::snapshots::{MemorySnapshotStore, SnapshotRecord, SnapshotStore};
use crate::state::KernelState;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Subscriber(#[from] SubscriberBusError),

    #[error("projection '{0}' has no cursor for this business yet")]
    NothingToSnapshot(String),
}

/// The assembled kernel.
pub struct Kernel<S: EventStore> {
    bus: Arc<CommandBus<S>>,
    state: KernelState,
    snapshots: Arc<dyn SnapshotStore>,
    replay: ReplayEngine<S>,
    journal: Arc<AuditJournal>,
}

impl Kernel<MemoryEventStore> {
    /// Fresh in-memory kernel (tests, development).
    pub fn in_memory(clock: Arc<dyn Clock>) -> Result<Self, KernelError> {
        Self::in_memory_with_limits(
            clock,
            RateLimitTiers::default(),
            AnomalyThresholds::default(),
        )
    }

    pub fn in_memory_with_limits(
        clock: Arc<dyn Clock>,
        tiers: RateLimitTiers,
        thresholds: AnomalyThresholds,
    ) -> Result<Self, KernelError> {
        let registry = Arc::new(EventTypeRegistry::new());
        let gate = ReplayGate::new();
        let store = Arc::new(MemoryEventStore::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            Arc::clone(&gate),
        ));
        Self::assemble(store, registry, gate, clock, tiers, thresholds)
    }
}

impl<S: EventStore> Kernel<S> {
    /// Assemble a kernel on an arbitrary store backend.
    pub fn assemble(
        store: Arc<S>,
        registry: Arc<EventTypeRegistry>,
        gate: Arc<ReplayGate>,
        clock: Arc<dyn Clock>,
        tiers: RateLimitTiers,
        thresholds: AnomalyThresholds,
    ) -> Result<Self, KernelError> {
        let state = KernelState::new();

        let guards = GuardPipeline::new(
            Arc::clone(&state.identity) as _,
            Arc::clone(&state.lifecycle) as _,
            Arc::clone(&state.feature_flags) as _,
            Arc::clone(&state.resilience) as _,
            Arc::clone(&state.compliance) as _,
            RateLimiter::new(tiers),
            AnomalyDetector::new(thresholds),
        );

        let mut runtime = ProjectionRuntime::new();
        for projection in state.projections() {
            runtime.register(projection).map_err(BusError::from)?;
        }

        let bus = Arc::new(CommandBus::new(
            Arc::clone(&store),
            registry,
            Arc::new(SubscriberRegistry::new()),
            guards,
            Arc::clone(&state.lifecycle),
            Arc::clone(&state.resilience),
            runtime,
            Arc::new(TenantLocks::new()),
            clock,
        ));
        admin::install(&bus)?;

        let replay = ReplayEngine::new(store, gate);

        Ok(Self {
            bus,
            state,
            snapshots: Arc::new(MemorySnapshotStore::new()),
            replay,
            journal: Arc::new(AuditJournal::new()),
        })
    }

    /// Handle one command through the single lawful write path,
    /// leaving an audit entry for the outcome.
    pub fn handle(&self, command: &CommandEnvelope) -> Outcome {
        let outcome = self.bus.handle(command);

        let (status, metadata) = match outcome.rejection() {
            None => (AuditStatus::Executed, serde_json::json!({})),
            Some(rejection) => (
                AuditStatus::Rejected,
                serde_json::json!({
                    "code": rejection.code.as_str(),
                    "policy_name": rejection.policy_name,
                }),
            ),
        };
        self.journal.record_audit(AuditEntry {
            entry_id: uuid::Uuid::new_v4(),
            event_id: outcome.events().first().map(|e| e.event_id),
            actor_type: command.actor_type,
            actor_id: command.actor_id.clone(),
            action: command.command_type.clone(),
            resource_type: "command".to_string(),
            resource_id: command.command_id.to_string(),
            business_id: command.business_id,
            branch_id: command.branch_id,
            status,
            occurred_at: self.bus.clock().now_utc(),
            metadata,
        });

        outcome
    }

    pub fn bus(&self) -> &Arc<CommandBus<S>> {
        &self.bus
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn journal(&self) -> &Arc<AuditJournal> {
        &self.journal
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    /// Register a domain engine through the plug-in contract.
    pub fn register_engine(&self, engine: &dyn Engine<S>) -> Result<(), KernelError> {
        let registrar = EngineRegistrar {
            engine_name: engine.name().to_string(),
            bus: &self.bus,
        };
        engine.register(&registrar)
    }

    /// Capture an append-only snapshot of one projection/business.
    pub fn take_snapshot(
        &self,
        projection: &str,
        business_id: BusinessId,
    ) -> Result<ProjectionCursor, KernelError> {
        let (bytes, cursor) = self.bus.with_runtime_mut(|runtime| {
            let bytes = runtime.snapshot(projection, business_id)?;
            Ok::<_, RuntimeError>((bytes, runtime.cursor(projection, business_id)))
        })?;
        let cursor =
            cursor.ok_or_else(|| KernelError::NothingToSnapshot(projection.to_string()))?;

        self.snapshots.append(SnapshotRecord {
            projection_name: projection.to_string(),
            business_id,
            cursor,
            bytes,
            taken_at: self.bus.clock().now_utc(),
        });
        Ok(cursor)
    }

    /// Rebuild projections from the log (and optionally snapshots).
    ///
    /// A business-scoped replay takes that tenant's write lock so it
    /// cannot interleave with commits on the same business; the
    /// replay gate additionally blocks every append store-wide.
    pub fn replay(&self, options: &ReplayOptions) -> Result<ReplayReport, ReplayError> {
        match options.scope {
            ReplayScope::Business(business_id) => {
                let lock = self.bus.tenant_locks().for_business(business_id);
                let _tenant = lock.lock().unwrap_or_else(|e| e.into_inner());
                self.bus
                    .with_runtime_mut(|runtime| {
                        self.replay.replay(runtime, self.snapshots.as_ref(), options)
                    })
            }
            ReplayScope::Unscoped => self.bus.with_runtime_mut(|runtime| {
                self.replay.replay(runtime, self.snapshots.as_ref(), options)
            }),
        }
    }
}

impl<S: EventStore> core::fmt::Debug for Kernel<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel").finish_non_exhaustive()
    }
}

/// Engine plug-in contract.
///
/// An engine registers event types in its own namespace, command
/// handlers with declared scope/flag policies, projections, and
/// subscriptions to other engines' events.
pub trait Engine<S: EventStore> {
    fn name(&self) -> &str;
    fn register(&self, registrar: &EngineRegistrar<'_, S>) -> Result<(), KernelError>;
}

/// Registration facade handed to engines; enforces namespace
/// discipline (an engine only owns types in its own namespace).
pub struct EngineRegistrar<'a, S: EventStore> {
    engine_name: String,
    bus: &'a Arc<CommandBus<S>>,
}

impl<'a, S: EventStore> EngineRegistrar<'a, S> {
    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    fn ensure_owned(&self, dotted_type: &str) -> Result<(), KernelError> {
        let namespace = dotted_type.split('.').next().unwrap_or_default();
        if namespace != self.engine_name {
            return Err(KernelError::Registry(RegistryError::InvalidFormat(format!(
                "'{dotted_type}' is outside the '{}' namespace",
                self.engine_name
            ))));
        }
        Ok(())
    }

    pub fn register_event_type(&self, event_type: &str) -> Result<(), KernelError> {
        self.ensure_owned(event_type)?;
        self.bus.registry().register(event_type)?;
        Ok(())
    }

    pub fn register_event_type_with_validator(
        &self,
        event_type: &str,
        validator: PayloadValidator,
    ) -> Result<(), KernelError> {
        self.ensure_owned(event_type)?;
        self.bus
            .registry()
            .register_with_validator(event_type, validator)?;
        Ok(())
    }

    pub fn register_command(
        &self,
        command_type: &str,
        policy: CommandPolicy,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), KernelError> {
        self.ensure_owned(command_type)?;
        self.bus.register_command(command_type, policy, handler)?;
        Ok(())
    }

    pub fn register_projection(&self, projection: Box<dyn Projection>) -> Result<(), KernelError> {
        self.bus.register_projection(projection)?;
        Ok(())
    }

    /// Subscribe to another engine's events. Self-subscription needs
    /// `subscribe_own`.
    pub fn subscribe(
        &self,
        event_type: &str,
        name: &str,
        handler: Arc<dyn Subscriber>,
    ) -> Result<(), KernelError> {
        self.bus
            .subscribers()
            .register(event_type, &self.engine_name, name, handler, false)?;
        Ok(())
    }

    /// Explicitly whitelisted self-subscription.
    pub fn subscribe_own(
        &self,
        event_type: &str,
        name: &str,
        handler: Arc<dyn Subscriber>,
    ) -> Result<(), KernelError> {
        self.bus
            .subscribers()
            .register(event_type, &self.engine_name, name, handler, true)?;
        Ok(())
    }
}
