//! End-to-end tests for the full kernel pipeline.
//!
//! Command → guards → handler → chain/hash → append → projections →
//! subscribers, with two small domain engines (cash, retail) plugged
//! in through the engine contract.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use bos_core::{
    ActorContext, BranchId, BusinessId, Clock, FixedClock, Rejection, RejectionCode,
};
use bos_events::{
    CommandEnvelope, EventRecord, Outcome, Projection, ProjectionError, SubscriberError,
    GENESIS_HASH,
};
use bos_policy::CommandPolicy;

use crate::audit::AuditStatus;
use crate::bus::{CommandHandler, EventDraft, HandlerContext};
use crate::event_store::{EventStore, MemoryEventStore, ReadQuery};
use crate::projections::ProjectionView;
use crate::kernel::{Engine, EngineRegistrar, Kernel, KernelError};
use crate::replay::{ReplayOptions, ReplayScope};

const CASH_PROJECTION: &str = "cash.drawers";
const RETAIL_PROJECTION: &str = "retail.sales";

fn handler<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&CommandEnvelope, &ProjectionView<'_>, &HandlerContext<'_>) -> Result<Vec<EventDraft>, Rejection>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Counts opened drawers per business.
#[derive(Default)]
struct CashDrawerProjection {
    opened: BTreeMap<BusinessId, u64>,
}

impl Projection for CashDrawerProjection {
    fn name(&self) -> &str {
        CASH_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        event_type == "cash.drawer.opened.v1"
    }

    fn apply(&mut self, record: &EventRecord) {
        *self.opened.entry(record.business_id).or_insert(0) += 1;
    }

    fn truncate(&mut self) {
        self.opened.clear();
    }

    fn truncate_business(&mut self, business_id: BusinessId) {
        self.opened.remove(&business_id);
    }

    fn snapshot(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        serde_json::to_vec(&self.opened.get(&business_id).copied().unwrap_or(0))
            .map_err(|e| ProjectionError::Encode(e.to_string()))
    }

    fn restore(&mut self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        let opened: u64 =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        self.opened.insert(business_id, opened);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Sums sale totals per business.
#[derive(Default)]
struct RetailSalesProjection {
    totals: BTreeMap<BusinessId, i64>,
}

impl Projection for RetailSalesProjection {
    fn name(&self) -> &str {
        RETAIL_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        event_type == "retail.sale.completed.v1"
    }

    fn apply(&mut self, record: &EventRecord) {
        let total = record.payload["total"].as_i64().unwrap_or(0);
        *self.totals.entry(record.business_id).or_insert(0) += total;
    }

    fn truncate(&mut self) {
        self.totals.clear();
    }

    fn truncate_business(&mut self, business_id: BusinessId) {
        self.totals.remove(&business_id);
    }

    fn snapshot(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        serde_json::to_vec(&self.totals.get(&business_id).copied().unwrap_or(0))
            .map_err(|e| ProjectionError::Encode(e.to_string()))
    }

    fn restore(&mut self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        let total: i64 =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        self.totals.insert(business_id, total);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct CashEngine;

impl Engine<MemoryEventStore> for CashEngine {
    fn name(&self) -> &str {
        "cash"
    }

    fn register(
        &self,
        registrar: &EngineRegistrar<'_, MemoryEventStore>,
    ) -> Result<(), KernelError> {
        registrar.register_event_type("cash.drawer.opened.v1")?;
        registrar.register_command(
            "cash.drawer.open.request",
            CommandPolicy::default()
                .branch_required()
                .with_flag("ENABLE_CASH_ENGINE"),
            handler(|command, _view, _ctx| {
                let drawer = command.payload["drawer_id"].as_str().ok_or_else(|| {
                    Rejection::new(
                        RejectionCode::InvalidCommandStructure,
                        "'drawer_id' is required",
                        "cash_engine",
                    )
                })?;
                Ok(vec![EventDraft::new(
                    "cash.drawer.opened.v1",
                    json!({"drawer_id": drawer}),
                )])
            }),
        )?;
        registrar.register_projection(Box::new(CashDrawerProjection::default()))?;
        Ok(())
    }
}

struct RetailEngine;

impl Engine<MemoryEventStore> for RetailEngine {
    fn name(&self) -> &str {
        "retail"
    }

    fn register(
        &self,
        registrar: &EngineRegistrar<'_, MemoryEventStore>,
    ) -> Result<(), KernelError> {
        registrar.register_event_type("retail.sale.completed.v1")?;
        registrar.register_command(
            "retail.sale.checkout.request",
            CommandPolicy::default().with_flag("ENABLE_RETAIL_ENGINE"),
            handler(|command, _view, _ctx| {
                let total = command.payload["total"].as_i64().unwrap_or(0);
                Ok(vec![EventDraft::new(
                    "retail.sale.completed.v1",
                    json!({"total": total}),
                )])
            }),
        )?;
        registrar.register_projection(Box::new(RetailSalesProjection::default()))?;
        Ok(())
    }
}

struct Fixture {
    kernel: Kernel<MemoryEventStore>,
    clock: Arc<FixedClock>,
    admin: ActorContext,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn fixture() -> Fixture {
    let clock = Arc::new(FixedClock::new(start_time()));
    let kernel = Kernel::in_memory(clock.clone() as Arc<dyn bos_core::Clock>).unwrap();
    kernel.register_engine(&CashEngine).unwrap();
    kernel.register_engine(&RetailEngine).unwrap();
    Fixture {
        kernel,
        clock,
        admin: ActorContext::human("admin"),
    }
}

impl Fixture {
    fn command(
        &self,
        command_type: &str,
        business_id: BusinessId,
        actor: &ActorContext,
        payload: serde_json::Value,
    ) -> CommandEnvelope {
        let engine = command_type.split('.').next().unwrap().to_string();
        CommandEnvelope::new(
            command_type,
            business_id,
            actor.clone(),
            engine,
            self.clock.now_utc(),
            payload,
        )
    }

    fn accept(&self, command: &CommandEnvelope) -> Vec<EventRecord> {
        match self.kernel.handle(command) {
            Outcome::Accepted { events } => events,
            Outcome::Rejected { rejection } => {
                panic!("expected acceptance, got {rejection}")
            }
        }
    }

    fn bootstrap(&self, business_id: BusinessId, actor: &ActorContext) -> EventRecord {
        let command = self.command(
            "identity.business.bootstrap.request",
            business_id,
            actor,
            json!({"name": "Acme Trading"}),
        );
        self.accept(&command).remove(0)
    }

    fn set_flag(&self, business_id: BusinessId, actor: &ActorContext, key: &str) -> EventRecord {
        let command = self.command(
            "feature_flag.set.request",
            business_id,
            actor,
            json!({"flag_key": key, "status": "ENABLED"}),
        );
        self.accept(&command).remove(0)
    }

    fn activate(&self, business_id: BusinessId, actor: &ActorContext) {
        let command = self.command(
            "identity.business.activate.request",
            business_id,
            actor,
            json!({}),
        );
        self.accept(&command);
    }

    fn add_branch(&self, business_id: BusinessId, actor: &ActorContext) -> BranchId {
        let branch_id = BranchId::new();
        let command = self.command(
            "identity.branch.add.request",
            business_id,
            actor,
            json!({"branch_id": branch_id.to_string(), "name": "Main Street"}),
        );
        self.accept(&command);
        branch_id
    }

    fn event_count(&self, business_id: BusinessId) -> usize {
        self.kernel
            .bus()
            .store()
            .read(business_id, &ReadQuery::default())
            .unwrap()
            .len()
    }
}

#[test]
fn genesis_append_starts_the_chain() {
    let fixture = fixture();
    let business = BusinessId::new();

    let bootstrapped = fixture.bootstrap(business, &fixture.admin.clone());

    assert_eq!(bootstrapped.previous_event_hash, GENESIS_HASH);
    assert_eq!(bootstrapped.event_hash.len(), 64);
    assert_eq!(bootstrapped.event_type, "identity.business.bootstrapped.v1");
}

#[test]
fn chain_continues_from_the_previous_event() {
    let fixture = fixture();
    let business = BusinessId::new();

    let bootstrapped = fixture.bootstrap(business, &fixture.admin.clone());
    let flag_set = fixture.set_flag(business, &fixture.admin.clone(), "ENABLE_RETAIL_ENGINE");

    assert_eq!(flag_set.previous_event_hash, bootstrapped.event_hash);
    assert_eq!(
        fixture.kernel.bus().store().verify_chain(business).unwrap(),
        2
    );
}

#[test]
fn idempotent_resubmission_returns_the_original_outcome() {
    let fixture = fixture();
    let business = BusinessId::new();
    fixture.bootstrap(business, &fixture.admin.clone());

    let command = fixture
        .command(
            "feature_flag.set.request",
            business,
            &fixture.admin.clone(),
            json!({"flag_key": "ENABLE_RETAIL_ENGINE", "status": "ENABLED"}),
        )
        .with_idempotency_key("flag-set-1");

    let first = fixture.kernel.handle(&command);
    let size_after_first = fixture.event_count(business);
    let second = fixture.kernel.handle(&command);

    assert!(first.is_accepted());
    assert_eq!(first, second);
    assert_eq!(fixture.event_count(business), size_after_first);
}

#[test]
fn reused_idempotency_key_with_different_command_is_rejected() {
    let fixture = fixture();
    let business = BusinessId::new();
    fixture.bootstrap(business, &fixture.admin.clone());

    let first = fixture
        .command(
            "feature_flag.set.request",
            business,
            &fixture.admin.clone(),
            json!({"flag_key": "ENABLE_RETAIL_ENGINE", "status": "ENABLED"}),
        )
        .with_idempotency_key("shared-key");
    assert!(fixture.kernel.handle(&first).is_accepted());

    let second = fixture
        .command(
            "feature_flag.set.request",
            business,
            &fixture.admin.clone(),
            json!({"flag_key": "ENABLE_CASH_ENGINE", "status": "ENABLED"}),
        )
        .with_idempotency_key("shared-key");

    let outcome = fixture.kernel.handle(&second);
    assert_eq!(
        outcome.rejection().unwrap().code,
        RejectionCode::DuplicateRequest
    );
}

#[test]
fn branch_required_command_without_branch_is_rejected() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_CASH_ENGINE");
    fixture.activate(business, &admin);

    let command = fixture.command(
        "cash.drawer.open.request",
        business,
        &admin,
        json!({"drawer_id": "d-1"}),
    );

    let outcome = fixture.kernel.handle(&command);
    let rejection = outcome.rejection().unwrap();
    assert_eq!(rejection.code, RejectionCode::BranchRequiredMissing);
    assert_eq!(rejection.policy_name, "scope_guard");
}

#[test]
fn branch_scoped_command_succeeds_with_branch() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_CASH_ENGINE");
    fixture.activate(business, &admin);
    let branch = fixture.add_branch(business, &admin);

    let command = fixture
        .command(
            "cash.drawer.open.request",
            business,
            &admin,
            json!({"drawer_id": "d-1"}),
        )
        .with_branch(branch);

    let events = fixture.accept(&command);
    assert_eq!(events[0].event_type, "cash.drawer.opened.v1");
    assert_eq!(events[0].branch_id, Some(branch));
}

#[test]
fn cross_tenant_actor_is_denied() {
    let fixture = fixture();
    let business_a = BusinessId::new();
    let business_b = BusinessId::new();
    let admin_a = ActorContext::human("admin-a");
    let admin_b = ActorContext::human("admin-b");
    fixture.bootstrap(business_a, &admin_a);
    fixture.bootstrap(business_b, &admin_b);

    // admin-a holds scope for A only; B exists, so no genesis path.
    let command = fixture.command(
        "feature_flag.set.request",
        business_b,
        &admin_a,
        json!({"flag_key": "ENABLE_RETAIL_ENGINE", "status": "ENABLED"}),
    );

    let outcome = fixture.kernel.handle(&command);
    assert_eq!(
        outcome.rejection().unwrap().code,
        RejectionCode::ActorUnauthorizedBusiness
    );
}

#[test]
fn read_only_mode_blocks_writes_but_not_reads() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_RETAIL_ENGINE");
    fixture.activate(business, &admin);

    let set_mode = fixture.command(
        "resilience.mode.set.request",
        business,
        &admin,
        json!({"mode": "READ_ONLY", "reason": "maintenance"}),
    );
    fixture.accept(&set_mode);

    let checkout = fixture.command(
        "retail.sale.checkout.request",
        business,
        &admin,
        json!({"total": 100}),
    );
    let outcome = fixture.kernel.handle(&checkout);
    assert_eq!(
        outcome.rejection().unwrap().code,
        RejectionCode::ReadOnlyMode
    );

    // Reads still succeed.
    assert!(fixture.event_count(business) > 0);

    // Recovery: the mode-set command passes in READ_ONLY.
    let recover = fixture.command(
        "resilience.mode.set.request",
        business,
        &admin,
        json!({"mode": "NORMAL"}),
    );
    fixture.accept(&recover);
    fixture.accept(&fixture.command(
        "retail.sale.checkout.request",
        business,
        &admin,
        json!({"total": 100}),
    ));
}

#[test]
fn projection_rebuild_matches_pre_wipe_snapshots() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();

    // 10 events across three engines: bootstrap, two flags, activate,
    // branch add, two drawer opens, three checkouts.
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_CASH_ENGINE");
    fixture.set_flag(business, &admin, "ENABLE_RETAIL_ENGINE");
    fixture.activate(business, &admin);
    let branch = fixture.add_branch(business, &admin);
    for drawer in ["d-1", "d-2"] {
        fixture.accept(
            &fixture
                .command(
                    "cash.drawer.open.request",
                    business,
                    &admin,
                    json!({"drawer_id": drawer}),
                )
                .with_branch(branch),
        );
    }
    for total in [10, 20, 30] {
        fixture.accept(&fixture.command(
            "retail.sale.checkout.request",
            business,
            &admin,
            json!({"total": total}),
        ));
    }
    assert_eq!(fixture.event_count(business), 10);

    let names = fixture
        .kernel
        .bus()
        .with_runtime_mut(|runtime| runtime.projection_names());
    let before: Vec<(String, Vec<u8>)> = names
        .iter()
        .map(|name| {
            let bytes = fixture
                .kernel
                .bus()
                .with_runtime_mut(|runtime| runtime.snapshot(name, business))
                .unwrap();
            (name.clone(), bytes)
        })
        .collect();

    let report = fixture
        .kernel
        .replay(&ReplayOptions::business(business))
        .unwrap();
    assert!(report.chain_verified);
    assert_eq!(report.events_processed, 10);

    for (name, expected) in before {
        let rebuilt = fixture
            .kernel
            .bus()
            .with_runtime_mut(|runtime| runtime.snapshot(&name, business))
            .unwrap();
        assert_eq!(rebuilt, expected, "projection '{name}' diverged after replay");
    }
}

#[test]
fn snapshot_start_replay_equals_full_replay() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_RETAIL_ENGINE");
    fixture.activate(business, &admin);

    for total in [5, 7] {
        fixture.accept(&fixture.command(
            "retail.sale.checkout.request",
            business,
            &admin,
            json!({"total": total}),
        ));
    }

    // Snapshot mid-stream, then keep writing.
    fixture
        .kernel
        .take_snapshot(RETAIL_PROJECTION, business)
        .unwrap();
    for total in [11, 13] {
        fixture.accept(&fixture.command(
            "retail.sale.checkout.request",
            business,
            &admin,
            json!({"total": total}),
        ));
    }

    let full = {
        fixture
            .kernel
            .replay(&ReplayOptions::business(business))
            .unwrap();
        fixture
            .kernel
            .bus()
            .with_runtime_mut(|runtime| runtime.snapshot(RETAIL_PROJECTION, business))
            .unwrap()
    };

    let from_snapshot = {
        let options = ReplayOptions {
            from_snapshot: true,
            projections: Some(vec![RETAIL_PROJECTION.to_string()]),
            ..ReplayOptions::business(business)
        };
        let report = fixture.kernel.replay(&options).unwrap();
        assert!(report.snapshot_used);
        fixture
            .kernel
            .bus()
            .with_runtime_mut(|runtime| runtime.snapshot(RETAIL_PROJECTION, business))
            .unwrap()
    };

    assert_eq!(full, from_snapshot);
}

#[test]
fn rejected_commands_are_recorded_as_events() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.activate(business, &admin);

    // Retail flag never enabled: FEATURE_DISABLED.
    let checkout = fixture.command(
        "retail.sale.checkout.request",
        business,
        &admin,
        json!({"total": 100}),
    );
    let outcome = fixture.kernel.handle(&checkout);
    assert_eq!(
        outcome.rejection().unwrap().code,
        RejectionCode::FeatureDisabled
    );

    let recorded = fixture
        .kernel
        .bus()
        .store()
        .read(
            business,
            &ReadQuery {
                event_types: vec!["rejection.recorded.v1".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0].payload["rejection"]["code"],
        "FEATURE_DISABLED"
    );
    assert_eq!(
        recorded[0].payload["command_type"],
        "retail.sale.checkout.request"
    );
}

#[test]
fn rejection_recording_can_be_disabled_per_business() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.activate(business, &admin);
    fixture.kernel.bus().set_rejection_recording(business, false);

    let checkout = fixture.command(
        "retail.sale.checkout.request",
        business,
        &admin,
        json!({"total": 100}),
    );
    assert!(fixture.kernel.handle(&checkout).is_rejected());

    let recorded = fixture
        .kernel
        .bus()
        .store()
        .read(
            business,
            &ReadQuery {
                event_types: vec!["rejection.recorded.v1".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
    assert!(recorded.is_empty());
}

#[test]
fn subscribers_observe_committed_events_without_affecting_outcomes() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_RETAIL_ENGINE");
    fixture.activate(business, &admin);

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    fixture
        .kernel
        .bus()
        .subscribers()
        .register(
            "retail.sale.completed.v1",
            "accounting",
            "ledger-feed",
            Arc::new(move |_: &EventRecord| -> Result<(), SubscriberError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            false,
        )
        .unwrap();
    fixture
        .kernel
        .bus()
        .subscribers()
        .register(
            "retail.sale.completed.v1",
            "accounting",
            "always-failing",
            Arc::new(|_: &EventRecord| -> Result<(), SubscriberError> {
                Err(SubscriberError::Failed("boom".to_string()))
            }),
            false,
        )
        .unwrap();

    let outcome = fixture.kernel.handle(&fixture.command(
        "retail.sale.checkout.request",
        business,
        &admin,
        json!({"total": 42}),
    ));

    assert!(outcome.is_accepted());
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn unknown_command_type_is_rejected() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);

    let command = fixture.command(
        "workshop.job.start.request",
        business,
        &admin,
        json!({}),
    );
    let outcome = fixture.kernel.handle(&command);
    assert_eq!(
        outcome.rejection().unwrap().code,
        RejectionCode::UnknownCommand
    );
}

#[test]
fn handler_is_deterministic_over_fixed_inputs() {
    // Same command against two identically-built kernels yields the
    // same payloads and chain hashes.
    let run = || {
        let fixture = fixture();
        let business = BusinessId::from_uuid(uuid::Uuid::from_u128(7));
        let admin = fixture.admin.clone();

        let mut command = fixture.command(
            "identity.business.bootstrap.request",
            business,
            &admin,
            json!({"name": "Acme Trading"}),
        );
        command.command_id = bos_core::CommandId::from_uuid(uuid::Uuid::from_u128(11));
        command.correlation_id =
            Some(bos_core::CorrelationId::from_uuid(uuid::Uuid::from_u128(13)));

        let events = fixture.accept(&command);
        (events[0].payload.clone(), events[0].previous_event_hash.clone())
    };

    assert_eq!(run(), run());
}

#[test]
fn replay_is_deterministic_across_runs() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.set_flag(business, &admin, "ENABLE_RETAIL_ENGINE");
    fixture.activate(business, &admin);
    for total in [1, 2, 3] {
        fixture.accept(&fixture.command(
            "retail.sale.checkout.request",
            business,
            &admin,
            json!({"total": total}),
        ));
    }

    let snapshot_after_replay = || {
        fixture
            .kernel
            .replay(&ReplayOptions::business(business))
            .unwrap();
        fixture
            .kernel
            .bus()
            .with_runtime_mut(|runtime| runtime.snapshot(RETAIL_PROJECTION, business))
            .unwrap()
    };

    assert_eq!(snapshot_after_replay(), snapshot_after_replay());
}

#[test]
fn unscoped_replay_covers_every_business() {
    let fixture = fixture();
    let admin_a = ActorContext::human("admin-a");
    let admin_b = ActorContext::human("admin-b");
    let business_a = BusinessId::new();
    let business_b = BusinessId::new();
    fixture.bootstrap(business_a, &admin_a);
    fixture.bootstrap(business_b, &admin_b);

    let options = ReplayOptions {
        scope: ReplayScope::Unscoped,
        until: None,
        projections: None,
        from_snapshot: false,
    };
    let report = fixture.kernel.replay(&options).unwrap();
    assert!(report.chain_verified);
    assert_eq!(report.events_processed, 2);
}

#[test]
fn ai_actor_cannot_execute_commands() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);
    fixture.activate(business, &admin);

    let advisor = ActorContext::new(bos_core::ActorType::Ai, "advisor-1");
    let command = fixture.command(
        "feature_flag.set.request",
        business,
        &advisor,
        json!({"flag_key": "ENABLE_RETAIL_ENGINE", "status": "ENABLED"}),
    );

    let outcome = fixture.kernel.handle(&command);
    assert_eq!(
        outcome.rejection().unwrap().code,
        RejectionCode::AiExecutionForbidden
    );
}

#[test]
fn deadline_is_enforced_before_commit() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);

    let expired = fixture
        .command(
            "feature_flag.set.request",
            business,
            &admin,
            json!({"flag_key": "ENABLE_RETAIL_ENGINE", "status": "ENABLED"}),
        )
        .with_deadline(start_time() - chrono::Duration::seconds(1));

    let outcome = fixture.kernel.handle(&expired);
    let rejection = outcome.rejection().unwrap();
    assert_eq!(rejection.code, RejectionCode::GuardInternalError);
    assert_eq!(rejection.policy_name, "deadline_guard");
}

#[test]
fn outcomes_are_journaled_for_audit() {
    let fixture = fixture();
    let business = BusinessId::new();
    let admin = fixture.admin.clone();
    fixture.bootstrap(business, &admin);

    // Business is still CREATED; a non-setup command is rejected.
    let rejected = fixture.command(
        "retail.sale.checkout.request",
        business,
        &admin,
        json!({"total": 1}),
    );
    assert!(fixture.kernel.handle(&rejected).is_rejected());

    let entries = fixture.kernel.journal().audit_for(business);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, AuditStatus::Executed);
    assert_eq!(entries[0].action, "identity.business.bootstrap.request");
    assert_eq!(entries[1].status, AuditStatus::Rejected);
    assert_eq!(entries[1].metadata["code"], "BUSINESS_SUSPENDED");
}
