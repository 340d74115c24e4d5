//! Tenant context and actor scope.
//!
//! `BusinessContext` is the read-only context a command executes
//! under. `TenantScope` is the resolved set of tenants an actor may
//! touch; the isolation guard checks commands against it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::actor::ActorContext;
use crate::id::{BranchId, BusinessId, CorrelationId, RequestId};
use crate::scope::LifecycleState;

/// Read-only context for one command execution.
///
/// Built by the bus from the command envelope plus kernel state.
/// Handlers receive it by reference and must not retain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessContext {
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub lifecycle_state: LifecycleState,
    pub actor: Option<ActorContext>,
    pub correlation_id: CorrelationId,
    pub request_id: RequestId,
    pub locale: String,
}

impl BusinessContext {
    pub fn new(business_id: BusinessId, correlation_id: CorrelationId) -> Self {
        Self {
            business_id,
            branch_id: None,
            lifecycle_state: LifecycleState::Active,
            actor: None,
            correlation_id,
            request_id: RequestId::new(),
            locale: "en".to_string(),
        }
    }

    pub fn with_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    pub fn with_actor(mut self, actor: ActorContext) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_lifecycle(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = state;
        self
    }
}

/// Branch access within one business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchAccess {
    /// Every branch of the business, present and future.
    All,
    /// Only the listed branches; empty set means business scope only.
    Only(BTreeSet<BranchId>),
}

/// An actor's authorized tenant boundaries.
///
/// Error paths built from this must never leak cross-tenant data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantScope {
    pub actor_id: String,
    branches: BTreeMap<BusinessId, BranchAccess>,
}

impl TenantScope {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            branches: BTreeMap::new(),
        }
    }

    /// Grant access to a whole business (all branches).
    pub fn grant_business(&mut self, business_id: BusinessId) {
        self.branches.insert(business_id, BranchAccess::All);
    }

    /// Grant access to one branch of a business. Widening to `All`
    /// is never implicit; repeated branch grants accumulate.
    pub fn grant_branch(&mut self, business_id: BusinessId, branch_id: BranchId) {
        match self.branches.entry(business_id).or_insert_with(|| {
            BranchAccess::Only(BTreeSet::new())
        }) {
            BranchAccess::All => {}
            BranchAccess::Only(set) => {
                set.insert(branch_id);
            }
        }
    }

    pub fn can_access_business(&self, business_id: BusinessId) -> bool {
        self.branches.contains_key(&business_id)
    }

    pub fn can_access_branch(&self, business_id: BusinessId, branch_id: BranchId) -> bool {
        match self.branches.get(&business_id) {
            None => false,
            Some(BranchAccess::All) => true,
            Some(BranchAccess::Only(set)) => set.contains(&branch_id),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_grant_covers_all_branches() {
        let business = BusinessId::new();
        let branch = BranchId::new();
        let mut scope = TenantScope::new("user-1");
        scope.grant_business(business);

        assert!(scope.can_access_business(business));
        assert!(scope.can_access_branch(business, branch));
    }

    #[test]
    fn branch_grant_is_narrow() {
        let business = BusinessId::new();
        let granted = BranchId::new();
        let other = BranchId::new();
        let mut scope = TenantScope::new("user-1");
        scope.grant_branch(business, granted);

        assert!(scope.can_access_business(business));
        assert!(scope.can_access_branch(business, granted));
        assert!(!scope.can_access_branch(business, other));
    }

    #[test]
    fn unknown_business_is_denied() {
        let scope = TenantScope::new("user-1");
        assert!(!scope.can_access_business(BusinessId::new()));
    }

    #[test]
    fn branch_grant_does_not_widen_existing_all() {
        let business = BusinessId::new();
        let mut scope = TenantScope::new("user-1");
        scope.grant_business(business);
        scope.grant_branch(business, BranchId::new());
        assert!(scope.can_access_branch(business, BranchId::new()));
    }
}
