//! Command envelope — the transient unit of intent.
//!
//! Commands are never persisted; they are transformed into events (or
//! into a structured rejection). Scope and actor requirements are
//! *command-type*-owned and live in the bus registration, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use bos_core::{ActorContext, ActorType, BranchId, BusinessId, CommandId, CorrelationId};

/// Suffix every command type must carry (`engine.domain.action.request`).
pub const COMMAND_TYPE_SUFFIX: &str = ".request";

/// Minimum dotted segments of a command type, suffix included.
pub const COMMAND_TYPE_MIN_SEGMENTS: usize = 3;

/// Inbound command envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    pub command_type: String,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub correlation_id: Option<CorrelationId>,
    pub issued_at: DateTime<Utc>,
    pub payload: JsonValue,
    pub source_engine: String,
    pub idempotency_key: Option<String>,

    /// Resolved identity, attached by the adapter after authentication.
    /// Must agree with `actor_type`/`actor_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_context: Option<ActorContext>,

    /// Caller-supplied execution deadline, enforced at phase
    /// boundaries. After append the event is durable regardless.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl CommandEnvelope {
    pub fn new(
        command_type: impl Into<String>,
        business_id: BusinessId,
        actor: ActorContext,
        source_engine: impl Into<String>,
        issued_at: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            command_id: CommandId::new(),
            command_type: command_type.into(),
            business_id,
            branch_id: None,
            actor_type: actor.actor_type,
            actor_id: actor.actor_id.clone(),
            correlation_id: None,
            issued_at,
            payload,
            source_engine: source_engine.into(),
            idempotency_key: None,
            actor_context: Some(actor),
            deadline: None,
        }
    }

    pub fn with_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Namespace segment of the command type (first dotted segment).
    pub fn namespace(&self) -> &str {
        self.command_type.split('.').next().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_first_segment() {
        let cmd = CommandEnvelope::new(
            "inventory.stock.move.request",
            BusinessId::new(),
            ActorContext::human("u-1"),
            "inventory",
            Utc::now(),
            serde_json::json!({}),
        );
        assert_eq!(cmd.namespace(), "inventory");
    }
}
