//! Feature flag projection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bos_core::{BranchId, BusinessId};
use bos_events::{EventRecord, ProjectionError};
use bos_policy::{FeatureFlag, FeatureFlagProvider, FlagStatus};

use super::SharedFold;

pub const FEATURE_FLAG_PROJECTION: &str = "kernel.feature_flags";

type FlagKey = (String, Option<BranchId>);

/// Folds `feature_flag.*` events; last write wins per
/// `(flag_key, branch_id?)` scope.
#[derive(Debug, Default)]
pub struct FeatureFlagProjection {
    flags: Mutex<BTreeMap<BusinessId, BTreeMap<FlagKey, FeatureFlag>>>,
}

impl FeatureFlagProjection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SharedFold for FeatureFlagProjection {
    fn name(&self) -> &'static str {
        FEATURE_FLAG_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            "feature_flag.set.v1" | "feature_flag.cleared.v1"
        )
    }

    fn fold(&self, record: &EventRecord) {
        let Some(flag_key) = record.payload["flag_key"].as_str() else {
            return;
        };
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        let business_flags = flags.entry(record.business_id).or_default();
        let scope: FlagKey = (flag_key.to_string(), record.branch_id);

        match record.event_type.as_str() {
            "feature_flag.set.v1" => {
                let Some(status) = record.payload["status"]
                    .as_str()
                    .and_then(FlagStatus::parse)
                else {
                    return;
                };
                business_flags.insert(
                    scope,
                    FeatureFlag {
                        flag_key: flag_key.to_string(),
                        business_id: record.business_id,
                        branch_id: record.branch_id,
                        status,
                        created_at: Some(record.received_at),
                    },
                );
            }
            "feature_flag.cleared.v1" => {
                business_flags.remove(&scope);
            }
            _ => {}
        }
    }

    fn reset(&self) {
        self.flags.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn reset_business(&self, business_id: BusinessId) {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&business_id);
    }

    fn snapshot_bytes(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        let flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        let rows: Vec<&FeatureFlag> = flags
            .get(&business_id)
            .map(|business_flags| business_flags.values().collect())
            .unwrap_or_default();
        serde_json::to_vec(&rows).map_err(|e| ProjectionError::Encode(e.to_string()))
    }

    fn restore_bytes(&self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        let rows: Vec<FeatureFlag> =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        let business_flags = flags.entry(business_id).or_default();
        business_flags.clear();
        for flag in rows {
            business_flags.insert((flag.flag_key.clone(), flag.branch_id), flag);
        }
        Ok(())
    }
}

impl FeatureFlagProvider for FeatureFlagProjection {
    fn flags_for_business(&self, business_id: BusinessId) -> Vec<FeatureFlag> {
        self.flags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .map(|business_flags| business_flags.values().cloned().collect())
            .unwrap_or_default()
    }
}
