//! Identity projection: tenant scopes, roles, api keys.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use bos_core::{BranchId, BusinessId, TenantScope};
use bos_events::{EventRecord, ProjectionError};
use bos_policy::guard::ActorDirectory;

use super::SharedFold;

pub const IDENTITY_PROJECTION: &str = "kernel.identity";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRow {
    pub key_id: String,
    pub label: String,
    pub actor_id: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct BusinessIdentity {
    /// actor_id → roles held in this business.
    roles: BTreeMap<String, BTreeSet<String>>,
    /// actor_id → branch grants (`None` entry means whole business).
    grants: BTreeMap<String, BTreeSet<Option<BranchId>>>,
    api_keys: BTreeMap<String, ApiKeyRow>,
}

/// Folds `identity.*` events into actor scopes the tenant-isolation
/// guard reads.
#[derive(Debug, Default)]
pub struct IdentityProjection {
    businesses: Mutex<BTreeMap<BusinessId, BusinessIdentity>>,
}

impl IdentityProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roles_of(&self, business_id: BusinessId, actor_id: &str) -> Vec<String> {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .and_then(|identity| identity.roles.get(actor_id))
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn api_key(&self, business_id: BusinessId, key_id: &str) -> Option<ApiKeyRow> {
        self.businesses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .and_then(|identity| identity.api_keys.get(key_id))
            .cloned()
    }

    fn grant(
        businesses: &mut BTreeMap<BusinessId, BusinessIdentity>,
        business_id: BusinessId,
        actor_id: &str,
        branch_id: Option<BranchId>,
    ) {
        businesses
            .entry(business_id)
            .or_default()
            .grants
            .entry(actor_id.to_string())
            .or_default()
            .insert(branch_id);
    }
}

impl SharedFold for IdentityProjection {
    fn name(&self) -> &'static str {
        IDENTITY_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            "identity.business.bootstrapped.v1"
                | "identity.role.assigned.v1"
                | "identity.role.revoked.v1"
                | "identity.api_key.created.v1"
                | "identity.api_key.revoked.v1"
                | "identity.api_key.rotated.v1"
        )
    }

    fn fold(&self, record: &EventRecord) {
        let mut businesses = self.businesses.lock().unwrap_or_else(|e| e.into_inner());
        match record.event_type.as_str() {
            "identity.business.bootstrapped.v1" => {
                // The bootstrapping actor becomes the owner with
                // whole-business access.
                let owner = record.payload["owner_actor_id"]
                    .as_str()
                    .unwrap_or(&record.actor_id)
                    .to_string();
                Self::grant(&mut businesses, record.business_id, &owner, None);
                businesses
                    .entry(record.business_id)
                    .or_default()
                    .roles
                    .entry(owner)
                    .or_default()
                    .insert("owner".to_string());
            }
            "identity.role.assigned.v1" => {
                let Some(actor_id) = record.payload["actor_id"].as_str() else {
                    return;
                };
                let role = record.payload["role"].as_str().unwrap_or("member");
                let branch_id = record.payload["branch_id"]
                    .as_str()
                    .and_then(|s| s.parse::<BranchId>().ok());

                Self::grant(&mut businesses, record.business_id, actor_id, branch_id);
                businesses
                    .entry(record.business_id)
                    .or_default()
                    .roles
                    .entry(actor_id.to_string())
                    .or_default()
                    .insert(role.to_string());
            }
            "identity.role.revoked.v1" => {
                let Some(actor_id) = record.payload["actor_id"].as_str() else {
                    return;
                };
                let role = record.payload["role"].as_str().unwrap_or_default();
                let Some(identity) = businesses.get_mut(&record.business_id) else {
                    return;
                };
                if let Some(roles) = identity.roles.get_mut(actor_id) {
                    roles.remove(role);
                    // Last role gone: the actor loses the tenant.
                    if roles.is_empty() {
                        identity.roles.remove(actor_id);
                        identity.grants.remove(actor_id);
                    }
                }
            }
            "identity.api_key.created.v1" => {
                let Some(key_id) = record.payload["key_id"].as_str() else {
                    return;
                };
                let row = ApiKeyRow {
                    key_id: key_id.to_string(),
                    label: record.payload["label"].as_str().unwrap_or_default().to_string(),
                    actor_id: record.actor_id.clone(),
                    active: true,
                };
                businesses
                    .entry(record.business_id)
                    .or_default()
                    .api_keys
                    .insert(key_id.to_string(), row);
            }
            "identity.api_key.revoked.v1" => {
                let Some(key_id) = record.payload["key_id"].as_str() else {
                    return;
                };
                if let Some(identity) = businesses.get_mut(&record.business_id) {
                    if let Some(key) = identity.api_keys.get_mut(key_id) {
                        key.active = false;
                    }
                }
            }
            "identity.api_key.rotated.v1" => {
                let Some(identity) = businesses.get_mut(&record.business_id) else {
                    return;
                };
                if let Some(replaced) = record.payload["replaces"].as_str() {
                    if let Some(old) = identity.api_keys.get_mut(replaced) {
                        old.active = false;
                    }
                }
                if let Some(key_id) = record.payload["key_id"].as_str() {
                    let row = ApiKeyRow {
                        key_id: key_id.to_string(),
                        label: record.payload["label"].as_str().unwrap_or_default().to_string(),
                        actor_id: record.actor_id.clone(),
                        active: true,
                    };
                    identity.api_keys.insert(key_id.to_string(), row);
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
        let identity: Option<BusinessIdentity> =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        let mut businesses = self.businesses.lock().unwrap_or_else(|e| e.into_inner());
        match identity {
            Some(identity) => {
                businesses.insert(business_id, identity);
            }
            None => {
                businesses.remove(&business_id);
            }
        }
        Ok(())
    }
}

impl ActorDirectory for IdentityProjection {
    fn tenant_scope(&self, actor_id: &str) -> Option<TenantScope> {
        let businesses = self.businesses.lock().unwrap_or_else(|e| e.into_inner());
        let mut scope = TenantScope::new(actor_id);

        for (business_id, identity) in businesses.iter() {
            let Some(grants) = identity.grants.get(actor_id) else {
                continue;
            };
            for grant in grants {
                match grant {
                    None => scope.grant_business(*business_id),
                    Some(branch_id) => scope.grant_branch(*business_id, *branch_id),
                }
            }
        }

        if scope.is_empty() {
            None
        } else {
            Some(scope)
        }
    }
}
