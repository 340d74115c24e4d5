//! The guard pipeline — composable, additive policy enforcement.
//!
//! Guards run in a fixed order before the engine handler, are pure
//! over the inputs they are handed, and short-circuit on the first
//! rejection. Fail-closed: an internal error inside a guard becomes a
//! `GUARD_INTERNAL_ERROR` rejection, never a pass.
//!
//! Order:
//! 1. structural validation
//! 2. actor guard (incl. AI execution ban)
//! 3. scope guard
//! 4. business-state guard
//! 5. feature-flag guard
//! 6. tenant-isolation guard
//! 7. rate-limit guard
//! 8. anomaly guard
//! 9. resilience-mode guard
//! 10. compliance guard

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use bos_core::{
    ActorRequirement, ActorType, BranchId, BusinessId, LifecycleState, Rejection, RejectionCode,
    ScopeRequirement, TenantScope,
};
use bos_events::{CommandEnvelope, COMMAND_TYPE_MIN_SEGMENTS, COMMAND_TYPE_SUFFIX};

use crate::anomaly::{ActivityRecord, AnomalyDetector};
use crate::compliance::{self, ComplianceProvider};
use crate::feature_flags::{resolve_flag, FeatureFlagProvider, FlagStatus};
use crate::ratelimit::RateLimiter;
use crate::resilience::ResilienceMode;

/// Per-command-type policy declaration (engine plug-in contract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    pub scope_requirement: ScopeRequirement,
    pub actor_requirement: ActorRequirement,
    /// Engine feature-flag key; commands with a key are OFF until the
    /// flag is explicitly ENABLED for the tenant.
    pub feature_flag_key: Option<String>,
    /// Passes the resilience guard in DEGRADED mode.
    pub essential: bool,
    /// Allowed while the business lifecycle is still CREATED.
    pub setup: bool,
    /// Explicitly permitted for AI actors (default: forbidden).
    pub ai_allowed: bool,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            scope_requirement: ScopeRequirement::BusinessAllowed,
            actor_requirement: ActorRequirement::ActorRequired,
            feature_flag_key: None,
            essential: false,
            setup: false,
            ai_allowed: false,
        }
    }
}

impl CommandPolicy {
    pub fn branch_required(mut self) -> Self {
        self.scope_requirement = ScopeRequirement::BranchRequired;
        self
    }

    pub fn system_allowed(mut self) -> Self {
        self.actor_requirement = ActorRequirement::SystemAllowed;
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>) -> Self {
        self.feature_flag_key = Some(key.into());
        self
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }

    pub fn setup(mut self) -> Self {
        self.setup = true;
        self
    }
}

/// Directory of known actors and their resolved tenant scopes
/// (backed by the kernel identity projection).
pub trait ActorDirectory: Send + Sync {
    fn tenant_scope(&self, actor_id: &str) -> Option<TenantScope>;
}

/// Branch ownership and business existence (backed by the kernel
/// lifecycle projection).
pub trait BranchDirectory: Send + Sync {
    fn is_branch_in_business(&self, branch_id: BranchId, business_id: BusinessId) -> bool;
    /// Whether any identity events exist for the business yet.
    fn business_known(&self, business_id: BusinessId) -> bool;
    fn lifecycle_state(&self, business_id: BusinessId) -> LifecycleState;
}

/// Current resilience mode (backed by the kernel resilience
/// projection).
pub trait ResilienceProvider: Send + Sync {
    fn current_mode(&self, business_id: BusinessId) -> ResilienceMode;
}

/// Internal guard failure; mapped fail-closed to
/// `GUARD_INTERNAL_ERROR`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("guard '{guard}' failed internally: {message}")]
pub struct GuardError {
    pub guard: &'static str,
    pub message: String,
}

/// What a passed pipeline hands back: advisories that belong in the
/// audit trail even though the command was accepted.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GuardTrail {
    pub compliance_warnings: Vec<JsonValue>,
    pub anomaly_advisories: Vec<String>,
}

/// Everything the pipeline evaluates for one command.
pub struct GuardInput<'a> {
    pub command: &'a CommandEnvelope,
    pub policy: &'a CommandPolicy,
    /// Clock reading taken once by the bus for this evaluation.
    pub now: DateTime<Utc>,
}

/// The fixed-order guard pipeline.
pub struct GuardPipeline {
    actors: Arc<dyn ActorDirectory>,
    branches: Arc<dyn BranchDirectory>,
    flags: Arc<dyn FeatureFlagProvider>,
    resilience: Arc<dyn ResilienceProvider>,
    compliance: Arc<dyn ComplianceProvider>,
    rate_limiter: RateLimiter,
    anomaly: AnomalyDetector,
}

impl GuardPipeline {
    pub fn new(
        actors: Arc<dyn ActorDirectory>,
        branches: Arc<dyn BranchDirectory>,
        flags: Arc<dyn FeatureFlagProvider>,
        resilience: Arc<dyn ResilienceProvider>,
        compliance: Arc<dyn ComplianceProvider>,
        rate_limiter: RateLimiter,
        anomaly: AnomalyDetector,
    ) -> Self {
        Self {
            actors,
            branches,
            flags,
            resilience,
            compliance,
            rate_limiter,
            anomaly,
        }
    }

    /// Evaluate all guards in order; first rejection wins.
    pub fn evaluate(&self, input: &GuardInput<'_>) -> Result<GuardTrail, Rejection> {
        let mut trail = GuardTrail::default();

        structural_guard(input)?;
        self.actor_guard(input)?;
        self.scope_guard(input)?;
        self.business_state_guard(input)?;
        self.feature_flag_guard(input)?;
        self.tenant_isolation_guard(input)?;
        self.rate_limit_guard(input)?;
        self.anomaly_guard(input, &mut trail)?;
        self.resilience_guard(input)?;
        self.compliance_guard(input, &mut trail)?;

        Ok(trail)
    }

    /// Record the command in the rate/anomaly windows after the
    /// outcome is known.
    pub fn record_activity(&self, command: &CommandEnvelope, now: DateTime<Utc>, was_rejected: bool) {
        self.rate_limiter
            .record(&command.actor_id, command.business_id, now);
        self.anomaly.record_activity(ActivityRecord {
            actor_id: command.actor_id.clone(),
            business_id: command.business_id,
            branch_id: command.branch_id,
            command_type: command.command_type.clone(),
            occurred_at: now,
            was_rejected,
        });
    }

    fn actor_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let command = input.command;

        if input.policy.actor_requirement == ActorRequirement::ActorRequired
            && command.actor_context.is_none()
        {
            return Err(Rejection::new(
                RejectionCode::ActorRequiredMissing,
                "an authenticated actor is required for this command",
                "actor_guard",
            ));
        }

        if command.actor_type == ActorType::Ai && !input.policy.ai_allowed {
            return Err(Rejection::new(
                RejectionCode::AiExecutionForbidden,
                "AI actors cannot execute operational commands; AI is advisory only",
                "ai_execution_guard",
            ));
        }

        Ok(())
    }

    fn scope_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let command = input.command;

        if input.policy.scope_requirement == ScopeRequirement::BranchRequired
            && command.branch_id.is_none()
        {
            return Err(Rejection::new(
                RejectionCode::BranchRequiredMissing,
                format!(
                    "command '{}' requires branch scope; no branch_id supplied",
                    command.command_type
                ),
                "scope_guard",
            ));
        }

        if let Some(branch_id) = command.branch_id {
            // Branch ownership only checks once the business exists;
            // a bootstrap command cannot reference branches anyway.
            if self.branches.business_known(command.business_id)
                && !self
                    .branches
                    .is_branch_in_business(branch_id, command.business_id)
            {
                return Err(Rejection::new(
                    RejectionCode::BranchNotInBusiness,
                    "branch does not belong to this business",
                    "scope_guard",
                ));
            }
        }

        Ok(())
    }

    fn business_state_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let command = input.command;

        // Lifecycle transitions are the recovery path out of
        // SUSPENDED; without this carve-out a suspended business
        // could never be resumed or wound down.
        if matches!(
            command.command_type.as_str(),
            "identity.business.activate.request" | "identity.business.close.request"
        ) {
            return Ok(());
        }

        let state = self.branches.lifecycle_state(command.business_id);

        match state {
            LifecycleState::Active => Ok(()),
            LifecycleState::Created => {
                if input.policy.setup {
                    Ok(())
                } else {
                    Err(Rejection::new(
                        RejectionCode::BusinessSuspended,
                        "business is CREATED; only setup commands are accepted before activation",
                        "business_state_guard",
                    ))
                }
            }
            LifecycleState::Suspended => Err(Rejection::new(
                RejectionCode::BusinessSuspended,
                "business is SUSPENDED; operations are not permitted",
                "business_state_guard",
            )),
            LifecycleState::Closed => Err(Rejection::new(
                RejectionCode::BusinessClosed,
                "business is CLOSED; operations are not permitted",
                "business_state_guard",
            )),
        }
    }

    fn feature_flag_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let Some(flag_key) = input.policy.feature_flag_key.as_deref() else {
            return Ok(());
        };

        let command = input.command;
        let flags = self.flags.flags_for_business(command.business_id);
        match resolve_flag(&flags, flag_key, command.branch_id) {
            Some(FlagStatus::Enabled) => Ok(()),
            Some(FlagStatus::Disabled) | None => Err(Rejection::new(
                RejectionCode::FeatureDisabled,
                format!("feature flag '{flag_key}' is not enabled for this business"),
                "feature_flag_guard",
            )),
        }
    }

    fn tenant_isolation_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let command = input.command;

        // SYSTEM actors are kernel-owned and not bound to a tenant
        // scope; everything else must hold a grant.
        if command.actor_type == ActorType::System {
            return Ok(());
        }

        let scope = self.actors.tenant_scope(&command.actor_id);

        // Genesis path: an unknown business has no grants yet, so the
        // bootstrapping actor is allowed through; the bootstrap event
        // establishes ownership.
        if !self.branches.business_known(command.business_id) {
            return Ok(());
        }

        let Some(scope) = scope else {
            return Err(Rejection::new(
                RejectionCode::ActorUnauthorizedBusiness,
                "access denied: actor is not authorized for this business",
                "tenant_isolation_guard",
            ));
        };

        if !scope.can_access_business(command.business_id) {
            return Err(Rejection::new(
                RejectionCode::ActorUnauthorizedBusiness,
                "access denied: actor is not authorized for this business",
                "tenant_isolation_guard",
            ));
        }

        if let Some(branch_id) = command.branch_id {
            if !scope.can_access_branch(command.business_id, branch_id) {
                return Err(Rejection::new(
                    RejectionCode::ActorUnauthorizedBranch,
                    "access denied: actor is not authorized for this branch",
                    "tenant_isolation_guard",
                ));
            }
        }

        Ok(())
    }

    fn rate_limit_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let command = input.command;
        let result = self.rate_limiter.check(
            &command.actor_id,
            command.business_id,
            command.actor_type,
            input.now,
        );
        if result.allowed {
            Ok(())
        } else {
            Err(Rejection::new(
                RejectionCode::QuotaExceeded,
                format!(
                    "rate limit exceeded: {} commands per window for {} actors",
                    result.limit,
                    command.actor_type.as_str()
                ),
                "rate_limit_guard",
            ))
        }
    }

    fn anomaly_guard(
        &self,
        input: &GuardInput<'_>,
        trail: &mut GuardTrail,
    ) -> Result<(), Rejection> {
        let command = input.command;
        let result = self.anomaly.check(
            &command.actor_id,
            command.business_id,
            command.branch_id,
            &command.command_type,
            input.now,
        );

        if result.blocks() {
            return Err(Rejection::new(
                RejectionCode::QuotaExceeded,
                result.description,
                "anomaly_guard",
            )
            .with_details(json!({"anomaly_type": result.anomaly_type})));
        }

        if result.detected {
            tracing::warn!(
                actor_id = %command.actor_id,
                anomaly_type = %result.anomaly_type,
                "anomaly advisory"
            );
            trail.anomaly_advisories.push(result.description);
        }
        Ok(())
    }

    fn resilience_guard(&self, input: &GuardInput<'_>) -> Result<(), Rejection> {
        let command = input.command;

        // The mode-set command is the recovery path; it passes in any
        // mode, otherwise READ_ONLY could never be left.
        if command.command_type == "resilience.mode.set.request" {
            return Ok(());
        }

        match self.resilience.current_mode(command.business_id) {
            ResilienceMode::Normal => Ok(()),
            ResilienceMode::Degraded => {
                if input.policy.essential {
                    Ok(())
                } else {
                    Err(Rejection::new(
                        RejectionCode::ReadOnlyMode,
                        "system is DEGRADED; only essential commands are accepted",
                        "resilience_guard",
                    ))
                }
            }
            ResilienceMode::ReadOnly => Err(Rejection::new(
                RejectionCode::ReadOnlyMode,
                "system is in READ_ONLY mode; write commands are not accepted",
                "resilience_guard",
            )),
        }
    }

    fn compliance_guard(
        &self,
        input: &GuardInput<'_>,
        trail: &mut GuardTrail,
    ) -> Result<(), Rejection> {
        let command = input.command;
        let profiles = self.compliance.profiles_for_business(command.business_id);
        let evaluation = compliance::evaluate(command, &profiles);

        trail
            .compliance_warnings
            .extend(evaluation.warnings.iter().cloned());

        if evaluation.allowed() {
            Ok(())
        } else {
            Err(Rejection::new(
                RejectionCode::ComplianceViolation,
                "command violates the active compliance profile",
                "compliance_guard",
            )
            .with_details(json!({"violations": evaluation.violations})))
        }
    }
}

/// Structural validation — the first guard.
///
/// Pure over the command and its declared policy; no providers.
pub fn structural_guard(input: &GuardInput<'_>) -> Result<(), Rejection> {
    let command = input.command;
    let reject = |message: String| {
        Err(Rejection::new(
            RejectionCode::InvalidCommandStructure,
            message,
            "command_validator",
        ))
    };

    if !command.command_type.ends_with(COMMAND_TYPE_SUFFIX) {
        return reject(format!(
            "command_type '{}' must end with '{COMMAND_TYPE_SUFFIX}'",
            command.command_type
        ));
    }

    let segments: Vec<&str> = command.command_type.split('.').collect();
    if segments.len() < COMMAND_TYPE_MIN_SEGMENTS || segments.iter().any(|s| s.is_empty()) {
        return reject(format!(
            "command_type '{}' must follow engine.domain.action.request format",
            command.command_type
        ));
    }

    if segments[0] != command.source_engine {
        return reject(format!(
            "command_type namespace '{}' does not match source_engine '{}'",
            segments[0], command.source_engine
        ));
    }

    if let Some(actor_context) = &command.actor_context {
        if actor_context.actor_type != command.actor_type
            || actor_context.actor_id != command.actor_id
        {
            return Err(Rejection::new(
                RejectionCode::ActorInvalid,
                "actor_context does not match the command's actor fields",
                "command_validator",
            ));
        }
    }

    if input.policy.actor_requirement == ActorRequirement::SystemAllowed
        && command.actor_type != ActorType::System
    {
        return Err(Rejection::new(
            RejectionCode::ActorInvalid,
            "SYSTEM_ALLOWED commands must run as actor_type SYSTEM",
            "command_validator",
        ));
    }

    Ok(())
}

/// Map an internal guard failure fail-closed.
impl From<GuardError> for Rejection {
    fn from(err: GuardError) -> Self {
        Rejection::guard_internal(err.guard, err.message)
    }
}
