//! Compliance profile projection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bos_core::{BranchId, BusinessId};
use bos_events::{EventRecord, ProjectionError};
use bos_policy::{ComplianceProfile, ComplianceProvider, ComplianceRule, ProfileStatus};

use super::SharedFold;

pub const COMPLIANCE_PROJECTION: &str = "kernel.compliance";

type ProfileKey = (String, Option<BranchId>);

/// Folds `compliance.profile.*` events into the active profile set.
#[derive(Debug, Default)]
pub struct ComplianceProjection {
    profiles: Mutex<BTreeMap<BusinessId, BTreeMap<ProfileKey, ComplianceProfile>>>,
}

impl ComplianceProjection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedFold for ComplianceProjection {
    fn name(&self) -> &'static str {
        COMPLIANCE_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            "compliance.profile.upserted.v1" | "compliance.profile.deactivated.v1"
        )
    }

    fn fold(&self, record: &EventRecord) {
        let Some(profile_id) = record.payload["profile_id"].as_str() else {
            return;
        };
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let business_profiles = profiles.entry(record.business_id).or_default();
        let key: ProfileKey = (profile_id.to_string(), record.branch_id);

        match record.event_type.as_str() {
            "compliance.profile.upserted.v1" => {
                let version = record.payload["version"].as_u64().unwrap_or(1) as u32;
                let rules: Vec<ComplianceRule> = record.payload["rules"]
                    .as_array()
                    .map(|rules| {
                        rules
                            .iter()
                            .filter_map(|rule| serde_json::from_value(rule.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();

                business_profiles.insert(
                    key,
                    ComplianceProfile {
                        profile_id: profile_id.to_string(),
                        business_id: record.business_id,
                        branch_id: record.branch_id,
                        version,
                        status: ProfileStatus::Active,
                        rules,
                        updated_at: Some(record.received_at),
                    },
                );
            }
            "compliance.profile.deactivated.v1" => {
                if let Some(profile) = business_profiles.get_mut(&key) {
                    profile.status = ProfileStatus::Inactive;
                    profile.updated_at = Some(record.received_at);
                }
            }
            _ => {}
        }
    }

    fn reset(&self) {
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn reset_business(&self, business_id: BusinessId) {
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&business_id);
    }

    fn snapshot_bytes(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let rows: Vec<&ComplianceProfile> = profiles
            .get(&business_id)
            .map(|business_profiles| business_profiles.values().collect())
            .unwrap_or_default();
        serde_json::to_vec(&rows).map_err(|e| ProjectionError::Encode(e.to_string()))
    }

    fn restore_bytes(&self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        let rows: Vec<ComplianceProfile> =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let business_profiles = profiles.entry(business_id).or_default();
        business_profiles.clear();
        for profile in rows {
            business_profiles.insert((profile.profile_id.clone(), profile.branch_id), profile);
        }
        Ok(())
    }
}

impl ComplianceProvider for ComplianceProjection {
    fn profiles_for_business(&self, business_id: BusinessId) -> Vec<ComplianceProfile> {
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .map(|business_profiles| business_profiles.values().cloned().collect())
            .unwrap_or_default()
    }
}
