//! Resilience mode projection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bos_core::BusinessId;
use bos_events::{EventRecord, ProjectionError};
use bos_policy::guard::ResilienceProvider;
use bos_policy::ResilienceMode;

use super::SharedFold;

pub const RESILIENCE_PROJECTION: &str = "kernel.resilience";

/// Folds `resilience.mode.set.v1` into the current per-business mode.
#[derive(Debug, Default)]
pub struct ResilienceProjection {
    modes: Mutex<BTreeMap<BusinessId, ResilienceMode>>,
}

impl ResilienceProjection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode_of(&self, business_id: BusinessId) -> ResilienceMode {
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&business_id)
            .copied()
            .unwrap_or_default()
    }
}

impl SharedFold for ResilienceProjection {
    fn name(&self) -> &'static str {
        RESILIENCE_PROJECTION
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        event_type == "resilience.mode.set.v1"
    }

    fn fold(&self, record: &EventRecord) {
        let Some(mode) = record.payload["mode"]
            .as_str()
            .and_then(ResilienceMode::parse)
        else {
            return;
        };
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.business_id, mode);
    }

    fn reset(&self) {
        self.modes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn reset_business(&self, business_id: BusinessId) {
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&business_id);
    }

    fn snapshot_bytes(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        serde_json::to_vec(&self.mode_of(business_id))
            .map_err(|e| ProjectionError::Encode(e.to_string()))
    }

    fn restore_bytes(&self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        let mode: ResilienceMode =
            serde_json::from_slice(bytes).map_err(|e| ProjectionError::Decode(e.to_string()))?;
        self.modes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(business_id, mode);
        Ok(())
    }
}

impl ResilienceProvider for ResilienceProjection {
    fn current_mode(&self, business_id: BusinessId) -> ResilienceMode {
        self.mode_of(business_id)
    }
}
