//! Business lifecycle and branch registry projection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use bos_core::{BranchId, BusinessId, LifecycleState};
use bos_events::{EventRecord, ProjectionError};
use bos_policy::guard::BranchDirectory;

use super::SharedFold;

pub const LIFECYCLE_PROJECTION: &str = "kernel.lifecycle";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct BranchRow {
    name: String,
    active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BusinessRow {
    name: String,
    state: LifecycleState,
    branches: BTreeMap<BranchId, BranchRow>,
}

/// Folds `identity.business.*` and `identity.branch.*` events into
/// the per-tenant lifecycle view the guards read.
#[derive(Debug, Default)]
pub struct LifecycleProjection {
    businesses: Mutex<BTreeMap<BusinessId, BusinessRow>>,
}

impl LifecycleProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, business_id: BusinessId) -> LifecycleState {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .map(|row| row.state)
            .unwrap_or(LifecycleState::Created)
    }

    pub fn business_name(&self, business_id: BusinessId) -> Option<String> {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .map(|row| row.name.clone())
    }

    pub fn active_branches(&self, business_id: BusinessId) -> Vec<BranchId> {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .map(|row| {
                row.branches
                    .iter()
                    .filter(|(_, branch)| branch.active)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SharedFold for LifecycleProjection {
    fn name(&self) -> &'static str {
        LIFECYCLE_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            "identity.business.bootstrapped.v1"
                | "identity.business.activated.v1"
                | "identity.business.suspended.v1"
                | "identity.business.closed.v1"
                | "identity.branch.added.v1"
                | "identity.branch.closed.v1"
        )
    }

    fn fold(&self, record: &EventRecord) {
        let mut businesses = self.businesses.lock().unwrap_or_else(|e| e.into_inner());
        match record.event_type.as_str() {
            "identity.business.bootstrapped.v1" => {
                let name = record.payload["name"].as_str().unwrap_or_default();
                businesses.insert(
                    record.business_id,
                    BusinessRow {
                        name: name.to_string(),
                        state: LifecycleState::Created,
                        branches: BTreeMap::new(),
                    },
                );
            }
            "identity.business.activated.v1" => {
                if let Some(row) = businesses.get_mut(&record.business_id) {
                    row.state = LifecycleState::Active;
                }
            }
            "identity.business.suspended.v1" => {
                if let Some(row) = businesses.get_mut(&record.business_id) {
                    row.state = LifecycleState::Suspended;
                }
            }
            "identity.business.closed.v1" => {
                if let Some(row) = businesses.get_mut(&record.business_id) {
                    row.state = LifecycleState::Closed;
                }
            }
            "identity.branch.added.v1" => {
                let branch_id = record.payload["branch_id"]
                    .as_str()
                    .and_then(|s| s.parse::<BranchId>().ok());
                if let (Some(row), Some(branch_id)) =
                    (businesses.get_mut(&record.business_id), branch_id)
                {
                    let name = record.payload["name"].as_str().unwrap_or_default();
                    row.branches.insert(
                        branch_id,
                        BranchRow {
                            name: name.to_string(),
                            active: true,
                        },
                    );
                }
            }
            "identity.branch.closed.v1" => {
                let branch_id = record.payload["branch_id"]
                    .as_str()
                    .and_then(|s| s.parse::<BranchId>().ok());
                if let (Some(row), Some(branch_id)) =
                    (businesses.get_mut(&record.business_id), branch_id)
                {
                    if let Some(branch) = row.branches.get_mut(&branch_id) {
                        branch.active = false;
                    }
                }
            }
            _ => {}
        }
    }

    fn reset(&self) {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn reset_business(&self, business_id: BusinessId) {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&business_id);
    }

    fn snapshot_bytes(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        let businesses = self.businesses.lock().unwrap_or_else(|e| e.into_inner());
        serde_json::to_vec(&businesses.get(&business_id))
            .map_err(|e| ProjectionError::Encode(e.to_string()))
    }

    fn restore_bytes(&self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        let row: Option<BusinessRow> =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        let mut businesses = self.businesses.lock().unwrap_or_else(|e| e.into_inner());
        match row {
            Some(row) => {
                businesses.insert(business_id, row);
            }
            None => {
                businesses.remove(&business_id);
            }
        }
        Ok(())
    }
}

impl BranchDirectory for LifecycleProjection {
    fn is_branch_in_business(&self, branch_id: BranchId, business_id: BusinessId) -> bool {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .and_then(|row| row.branches.get(&branch_id))
            .is_some_and(|branch| branch.active)
    }

    fn business_known(&self, business_id: BusinessId) -> bool {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&business_id)
    }

    fn lifecycle_state(&self, business_id: BusinessId) -> LifecycleState {
        self.state_of(business_id)
    }
}
