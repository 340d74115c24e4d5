//! Structured command rejections.
//!
//! A `Rejection` is not a Rust error in the infrastructure sense: it is
//! a deterministic, auditable business decision. Every denied command
//! carries exactly one of these, and it becomes part of the rejection
//! event's payload when rejection recording is enabled.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Closed set of rejection codes the kernel can produce.
///
/// Engines do not extend this set; domain-specific denials surface as
/// `ComplianceViolation` (declarative rules) or through engine handler
/// rejections reusing these codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    InvalidCommandStructure,
    UnknownCommand,
    UnknownEventType,
    MissingBusinessId,
    ActorRequiredMissing,
    ActorInvalid,
    ActorUnauthorizedBusiness,
    ActorUnauthorizedBranch,
    BranchRequiredMissing,
    BranchNotInBusiness,
    FeatureDisabled,
    ComplianceViolation,
    BusinessSuspended,
    BusinessClosed,
    QuotaExceeded,
    AiExecutionForbidden,
    DuplicateRequest,
    IdempotencyConflict,
    ChainMismatch,
    HashMismatch,
    ReadOnlyMode,
    GuardInternalError,
    StoreUnavailable,
}

impl RejectionCode {
    /// Wire representation (SCREAMING_SNAKE_CASE, stable).
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionCode::InvalidCommandStructure => "INVALID_COMMAND_STRUCTURE",
            RejectionCode::UnknownCommand => "UNKNOWN_COMMAND",
            RejectionCode::UnknownEventType => "UNKNOWN_EVENT_TYPE",
            RejectionCode::MissingBusinessId => "MISSING_BUSINESS_ID",
            RejectionCode::ActorRequiredMissing => "ACTOR_REQUIRED_MISSING",
            RejectionCode::ActorInvalid => "ACTOR_INVALID",
            RejectionCode::ActorUnauthorizedBusiness => "ACTOR_UNAUTHORIZED_BUSINESS",
            RejectionCode::ActorUnauthorizedBranch => "ACTOR_UNAUTHORIZED_BRANCH",
            RejectionCode::BranchRequiredMissing => "BRANCH_REQUIRED_MISSING",
            RejectionCode::BranchNotInBusiness => "BRANCH_NOT_IN_BUSINESS",
            RejectionCode::FeatureDisabled => "FEATURE_DISABLED",
            RejectionCode::ComplianceViolation => "COMPLIANCE_VIOLATION",
            RejectionCode::BusinessSuspended => "BUSINESS_SUSPENDED",
            RejectionCode::BusinessClosed => "BUSINESS_CLOSED",
            RejectionCode::QuotaExceeded => "QUOTA_EXCEEDED",
            RejectionCode::AiExecutionForbidden => "AI_EXECUTION_FORBIDDEN",
            RejectionCode::DuplicateRequest => "DUPLICATE_REQUEST",
            RejectionCode::IdempotencyConflict => "IDEMPOTENCY_CONFLICT",
            RejectionCode::ChainMismatch => "CHAIN_MISMATCH",
            RejectionCode::HashMismatch => "HASH_MISMATCH",
            RejectionCode::ReadOnlyMode => "READ_ONLY_MODE",
            RejectionCode::GuardInternalError => "GUARD_INTERNAL_ERROR",
            RejectionCode::StoreUnavailable => "STORE_UNAVAILABLE",
        }
    }
}

impl core::fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured reason for a denied command.
///
/// - Deterministic: same input produces the same rejection.
/// - Auditable: `policy_name` is the authoritative identifier of the
///   policy that denied the command.
/// - Serializable into the rejection event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectionCode,
    pub message: String,
    pub policy_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl Rejection {
    pub fn new(
        code: RejectionCode,
        message: impl Into<String>,
        policy_name: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            policy_name: policy_name.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    /// Fail-closed rejection for internal guard failures.
    pub fn guard_internal(policy_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(RejectionCode::GuardInternalError, message, policy_name)
    }
}

impl core::fmt::Display for Rejection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {} ({})", self.code, self.message, self.policy_name)
    }
}

/// Identifier parsing failure (kept out of the rejection set; callers
/// map it to `INVALID_COMMAND_STRUCTURE` at the command boundary).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {kind}: {message}")]
pub struct IdParseError {
    kind: &'static str,
    message: String,
}

impl IdParseError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
