//! Core-owned administrative surface.
//!
//! The kernel owns a small set of engines of its own: business
//! lifecycle, branches, roles and api keys (`identity`), feature
//! flags, resilience mode, and compliance profiles. They plug into
//! the bus through the same contract as any domain engine: event
//! types with payload validators, command handlers, and the kernel
//! state projections that fold their events.

use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use bos_core::{Rejection, RejectionCode};
use bos_events::{CommandEnvelope, PayloadValidator, RegistryError};
use bos_policy::{CommandPolicy, ComplianceRule, FlagStatus, ResilienceMode};

use crate::bus::{BusError, CommandBus, CommandHandler, EventDraft, HandlerContext};
use crate::event_store::EventStore;
use crate::projections::ProjectionView;
use crate::state::{LifecycleProjection, LIFECYCLE_PROJECTION};
use crate::state::{IdentityProjection, IDENTITY_PROJECTION};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Validator requiring string fields to be present and non-empty.
fn require_strings(fields: &'static [&'static str]) -> PayloadValidator {
    Arc::new(move |payload: &JsonValue| {
        for field in fields {
            match payload.get(*field).and_then(|v| v.as_str()) {
                Some(value) if !value.trim().is_empty() => {}
                _ => return Err(format!("'{field}' must be a non-empty string")),
            }
        }
        Ok(())
    })
}

fn invalid(message: impl Into<String>, policy: &str) -> Rejection {
    Rejection::new(RejectionCode::InvalidCommandStructure, message, policy)
}

fn payload_str<'a>(
    command: &'a CommandEnvelope,
    field: &str,
    policy: &str,
) -> Result<&'a str, Rejection> {
    command.payload[field]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(format!("'{field}' is required"), policy))
}

fn lifecycle<'a>(view: &ProjectionView<'a>) -> Result<&'a LifecycleProjection, Rejection> {
    view.get::<LifecycleProjection>(LIFECYCLE_PROJECTION)
        .ok_or_else(|| Rejection::guard_internal("identity_engine", "lifecycle projection missing"))
}

fn identity<'a>(view: &ProjectionView<'a>) -> Result<&'a IdentityProjection, Rejection> {
    view.get::<IdentityProjection>(IDENTITY_PROJECTION)
        .ok_or_else(|| Rejection::guard_internal("identity_engine", "identity projection missing"))
}

/// Register the administrative event types, handlers, and policies.
pub fn install<S: EventStore>(bus: &CommandBus<S>) -> Result<(), InstallError> {
    register_event_types(bus)?;
    register_identity_commands(bus)?;
    register_feature_flag_commands(bus)?;
    register_resilience_commands(bus)?;
    register_compliance_commands(bus)?;
    Ok(())
}

fn register_event_types<S: EventStore>(bus: &CommandBus<S>) -> Result<(), RegistryError> {
    let registry = bus.registry();

    registry.register_with_validator(
        "identity.business.bootstrapped.v1",
        require_strings(&["name", "owner_actor_id"]),
    )?;
    registry.register("identity.business.activated.v1")?;
    registry.register("identity.business.suspended.v1")?;
    registry.register("identity.business.closed.v1")?;
    registry.register_with_validator(
        "identity.branch.added.v1",
        require_strings(&["branch_id", "name"]),
    )?;
    registry
        .register_with_validator("identity.branch.closed.v1", require_strings(&["branch_id"]))?;
    registry.register_with_validator(
        "identity.role.assigned.v1",
        require_strings(&["actor_id", "role"]),
    )?;
    registry.register_with_validator(
        "identity.role.revoked.v1",
        require_strings(&["actor_id", "role"]),
    )?;
    registry.register_with_validator(
        "identity.api_key.created.v1",
        require_strings(&["key_id", "label"]),
    )?;
    registry
        .register_with_validator("identity.api_key.revoked.v1", require_strings(&["key_id"]))?;
    registry.register_with_validator(
        "identity.api_key.rotated.v1",
        require_strings(&["key_id", "replaces"]),
    )?;

    registry.register_with_validator(
        "feature_flag.set.v1",
        require_strings(&["flag_key", "status"]),
    )?;
    registry
        .register_with_validator("feature_flag.cleared.v1", require_strings(&["flag_key"]))?;

    registry.register_with_validator("resilience.mode.set.v1", require_strings(&["mode"]))?;

    registry.register_with_validator(
        "compliance.profile.upserted.v1",
        require_strings(&["profile_id"]),
    )?;
    registry.register_with_validator(
        "compliance.profile.deactivated.v1",
        require_strings(&["profile_id"]),
    )?;

    registry.register("rejection.recorded.v1")?;
    Ok(())
}

fn handler<F>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(&CommandEnvelope, &ProjectionView<'_>, &HandlerContext<'_>) -> Result<Vec<EventDraft>, Rejection>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

fn register_identity_commands<S: EventStore>(bus: &CommandBus<S>) -> Result<(), BusError> {
    bus.register_command(
        "identity.business.bootstrap.request",
        CommandPolicy::default().setup(),
        handler(|command, view, _ctx| {
            if lifecycle(view)?.business_name(command.business_id).is_some() {
                return Err(Rejection::new(
                    RejectionCode::DuplicateRequest,
                    "business is already bootstrapped",
                    "identity_engine",
                ));
            }
            let name = payload_str(command, "name", "identity_engine")?;
            Ok(vec![EventDraft::new(
                "identity.business.bootstrapped.v1",
                json!({
                    "name": name,
                    "owner_actor_id": command.actor_id,
                    "owner_actor_type": command.actor_type.as_str(),
                }),
            )])
        }),
    )?;

    bus.register_command(
        "identity.business.activate.request",
        CommandPolicy::default().setup(),
        handler(|command, view, _ctx| {
            use bos_core::LifecycleState::*;
            match lifecycle(view)?.state_of(command.business_id) {
                Created | Suspended => Ok(vec![EventDraft::new(
                    "identity.business.activated.v1",
                    json!({}),
                )]),
                // Activating an active business is a no-op, not an error.
                Active => Ok(vec![]),
                Closed => Err(Rejection::new(
                    RejectionCode::BusinessClosed,
                    "a closed business cannot be reactivated",
                    "identity_engine",
                )),
            }
        }),
    )?;

    bus.register_command(
        "identity.business.suspend.request",
        CommandPolicy::default(),
        handler(|command, view, _ctx| {
            let reason = command.payload["reason"].as_str().unwrap_or_default();
            match lifecycle(view)?.state_of(command.business_id) {
                bos_core::LifecycleState::Active => Ok(vec![EventDraft::new(
                    "identity.business.suspended.v1",
                    json!({"reason": reason}),
                )]),
                state => Err(invalid(
                    format!("cannot suspend a business in state {state}"),
                    "identity_engine",
                )),
            }
        }),
    )?;

    bus.register_command(
        "identity.business.close.request",
        CommandPolicy::default(),
        handler(|command, _view, _ctx| {
            let reason = command.payload["reason"].as_str().unwrap_or_default();
            Ok(vec![EventDraft::new(
                "identity.business.closed.v1",
                json!({"reason": reason}),
            )])
        }),
    )?;

    bus.register_command(
        "identity.branch.add.request",
        CommandPolicy::default().setup(),
        handler(|command, view, _ctx| {
            let branch_id = payload_str(command, "branch_id", "identity_engine")?;
            let branch = branch_id
                .parse::<bos_core::BranchId>()
                .map_err(|e| invalid(e.to_string(), "identity_engine"))?;
            let name = payload_str(command, "name", "identity_engine")?;

            if lifecycle(view)?
                .active_branches(command.business_id)
                .contains(&branch)
            {
                return Err(Rejection::new(
                    RejectionCode::DuplicateRequest,
                    "branch already exists",
                    "identity_engine",
                ));
            }
            Ok(vec![EventDraft::new(
                "identity.branch.added.v1",
                json!({"branch_id": branch_id, "name": name}),
            )])
        }),
    )?;

    bus.register_command(
        "identity.branch.close.request",
        CommandPolicy::default(),
        handler(|command, view, _ctx| {
            let branch_id = payload_str(command, "branch_id", "identity_engine")?;
            let branch = branch_id
                .parse::<bos_core::BranchId>()
                .map_err(|e| invalid(e.to_string(), "identity_engine"))?;

            if !lifecycle(view)?
                .active_branches(command.business_id)
                .contains(&branch)
            {
                return Err(Rejection::new(
                    RejectionCode::BranchNotInBusiness,
                    "branch does not belong to this business",
                    "identity_engine",
                ));
            }
            Ok(vec![EventDraft::new(
                "identity.branch.closed.v1",
                json!({"branch_id": branch_id}),
            )])
        }),
    )?;

    bus.register_command(
        "identity.role.assign.request",
        CommandPolicy::default().setup(),
        handler(|command, view, _ctx| {
            let actor_id = payload_str(command, "actor_id", "identity_engine")?;
            let role = payload_str(command, "role", "identity_engine")?;

            let mut payload = json!({"actor_id": actor_id, "role": role});
            if let Some(branch_id) = command.payload["branch_id"].as_str() {
                let branch = branch_id
                    .parse::<bos_core::BranchId>()
                    .map_err(|e| invalid(e.to_string(), "identity_engine"))?;
                if !lifecycle(view)?
                    .active_branches(command.business_id)
                    .contains(&branch)
                {
                    return Err(Rejection::new(
                        RejectionCode::BranchNotInBusiness,
                        "branch does not belong to this business",
                        "identity_engine",
                    ));
                }
                payload["branch_id"] = json!(branch_id);
            }
            Ok(vec![EventDraft::new("identity.role.assigned.v1", payload)])
        }),
    )?;

    bus.register_command(
        "identity.role.revoke.request",
        CommandPolicy::default(),
        handler(|command, view, _ctx| {
            let actor_id = payload_str(command, "actor_id", "identity_engine")?;
            let role = payload_str(command, "role", "identity_engine")?;

            let held = identity(view)?.roles_of(command.business_id, actor_id);
            if !held.iter().any(|r| r == role) {
                return Err(Rejection::new(
                    RejectionCode::ActorInvalid,
                    "actor does not hold this role",
                    "identity_engine",
                ));
            }
            Ok(vec![EventDraft::new(
                "identity.role.revoked.v1",
                json!({"actor_id": actor_id, "role": role}),
            )])
        }),
    )?;

    bus.register_command(
        "identity.api_key.create.request",
        CommandPolicy::default().setup(),
        handler(|command, view, _ctx| {
            let key_id = payload_str(command, "key_id", "identity_engine")?;
            let label = payload_str(command, "label", "identity_engine")?;

            if identity(view)?
                .api_key(command.business_id, key_id)
                .is_some_and(|key| key.active)
            {
                return Err(Rejection::new(
                    RejectionCode::DuplicateRequest,
                    "api key already exists",
                    "identity_engine",
                ));
            }
            Ok(vec![EventDraft::new(
                "identity.api_key.created.v1",
                json!({"key_id": key_id, "label": label}),
            )])
        }),
    )?;

    bus.register_command(
        "identity.api_key.revoke.request",
        CommandPolicy::default(),
        handler(|command, view, _ctx| {
            let key_id = payload_str(command, "key_id", "identity_engine")?;
            if identity(view)?.api_key(command.business_id, key_id).is_none() {
                return Err(invalid("api key does not exist", "identity_engine"));
            }
            Ok(vec![EventDraft::new(
                "identity.api_key.revoked.v1",
                json!({"key_id": key_id}),
            )])
        }),
    )?;

    bus.register_command(
        "identity.api_key.rotate.request",
        CommandPolicy::default(),
        handler(|command, view, _ctx| {
            let key_id = payload_str(command, "key_id", "identity_engine")?;
            let replaces = payload_str(command, "replaces", "identity_engine")?;
            let label = command.payload["label"].as_str().unwrap_or_default();

            if identity(view)?
                .api_key(command.business_id, replaces)
                .is_none()
            {
                return Err(invalid("replaced api key does not exist", "identity_engine"));
            }
            Ok(vec![EventDraft::new(
                "identity.api_key.rotated.v1",
                json!({"key_id": key_id, "replaces": replaces, "label": label}),
            )])
        }),
    )?;

    Ok(())
}

fn register_feature_flag_commands<S: EventStore>(bus: &CommandBus<S>) -> Result<(), BusError> {
    bus.register_command(
        "feature_flag.set.request",
        CommandPolicy::default().setup(),
        handler(|command, _view, _ctx| {
            let flag_key = payload_str(command, "flag_key", "feature_flag_engine")?;
            let status = payload_str(command, "status", "feature_flag_engine")?;
            if FlagStatus::parse(status).is_none() {
                return Err(invalid(
                    format!("status must be ENABLED or DISABLED, got '{status}'"),
                    "feature_flag_engine",
                ));
            }
            Ok(vec![EventDraft::new(
                "feature_flag.set.v1",
                json!({"flag_key": flag_key, "status": status}),
            )])
        }),
    )?;

    bus.register_command(
        "feature_flag.clear.request",
        CommandPolicy::default(),
        handler(|command, _view, _ctx| {
            let flag_key = payload_str(command, "flag_key", "feature_flag_engine")?;
            Ok(vec![EventDraft::new(
                "feature_flag.cleared.v1",
                json!({"flag_key": flag_key}),
            )])
        }),
    )?;

    Ok(())
}

fn register_resilience_commands<S: EventStore>(bus: &CommandBus<S>) -> Result<(), BusError> {
    bus.register_command(
        "resilience.mode.set.request",
        CommandPolicy::default().setup().essential(),
        handler(|command, _view, _ctx| {
            let mode = payload_str(command, "mode", "resilience_engine")?;
            if ResilienceMode::parse(mode).is_none() {
                return Err(invalid(
                    format!("mode must be NORMAL, DEGRADED or READ_ONLY, got '{mode}'"),
                    "resilience_engine",
                ));
            }
            let reason = command.payload["reason"].as_str().unwrap_or_default();
            Ok(vec![EventDraft::new(
                "resilience.mode.set.v1",
                json!({"mode": mode, "reason": reason}),
            )])
        }),
    )?;

    Ok(())
}

fn register_compliance_commands<S: EventStore>(bus: &CommandBus<S>) -> Result<(), BusError> {
    bus.register_command(
        "compliance.profile.upsert.request",
        CommandPolicy::default().setup(),
        handler(|command, _view, _ctx| {
            let profile_id = payload_str(command, "profile_id", "compliance_engine")?;
            let version = command.payload["version"].as_u64().unwrap_or(1);

            // Rules must parse; a malformed ruleset is rejected before
            // anything is persisted.
            let rules = command.payload["rules"].as_array().cloned().unwrap_or_default();
            for rule in &rules {
                serde_json::from_value::<ComplianceRule>(rule.clone())
                    .map_err(|e| invalid(format!("invalid rule: {e}"), "compliance_engine"))?;
            }

            Ok(vec![EventDraft::new(
                "compliance.profile.upserted.v1",
                json!({
                    "profile_id": profile_id,
                    "version": version,
                    "rules": rules,
                }),
            )])
        }),
    )?;

    bus.register_command(
        "compliance.profile.deactivate.request",
        CommandPolicy::default(),
        handler(|command, _view, _ctx| {
            let profile_id = payload_str(command, "profile_id", "compliance_engine")?;
            Ok(vec![EventDraft::new(
                "compliance.profile.deactivated.v1",
                json!({"profile_id": profile_id}),
            )])
        }),
    )?;

    Ok(())
}
