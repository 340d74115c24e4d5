//! Scope and lifecycle model.
//!
//! Scope requirements are command-owned: a command type declares
//! whether business scope suffices or a branch is mandatory. The
//! kernel never infers a branch.

use serde::{Deserialize, Serialize};

/// Scope requirement, declared per command type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeRequirement {
    /// Business scope is enough; branch_id is optional.
    BusinessAllowed,
    /// branch_id must be present and belong to the business.
    BranchRequired,
}

/// Business lifecycle state, derived from identity events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Bootstrapped but not yet activated; only setup commands pass.
    Created,
    Active,
    Suspended,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "CREATED",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Suspended => "SUSPENDED",
            LifecycleState::Closed => "CLOSED",
        }
    }

    /// Whether the business accepts mutating commands at all.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, LifecycleState::Created | LifecycleState::Active)
    }
}

impl core::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
