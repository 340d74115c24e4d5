//! Kernel state projections.
//!
//! The kernel's own read models: business lifecycle and branches,
//! identity (tenant scopes, roles, api keys), feature flags,
//! resilience mode, compliance profiles. They fold core-owned events
//! and double as the providers the guard pipeline reads, so they are
//! shared (`Arc`) between the projection runtime and the guards.

mod compliance;
mod feature_flags;
mod identity;
mod lifecycle;
mod resilience;

pub use compliance::{ComplianceProjection, COMPLIANCE_PROJECTION};
pub use feature_flags::{FeatureFlagProjection, FEATURE_FLAG_PROJECTION};
pub use identity::{ApiKeyRow, IdentityProjection, IDENTITY_PROJECTION};
pub use lifecycle::{LifecycleProjection, LIFECYCLE_PROJECTION};
pub use resilience::{ResilienceProjection, RESILIENCE_PROJECTION};

use std::any::Any;
use std::sync::Arc;

use bos_core::BusinessId;
use bos_events::{EventRecord, Projection, ProjectionError};

/// A shareable projection: the fold takes `&self` (interior locking)
/// so the same state can serve the runtime and the guard providers.
pub trait SharedFold: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn subscribes_to(&self, event_type: &str) -> bool;
    fn fold(&self, record: &EventRecord);
    fn reset(&self);
    fn reset_business(&self, business_id: BusinessId);
    fn snapshot_bytes(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError>;
    fn restore_bytes(&self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError>;
}

/// Adapter registering a shared state as a runtime projection.
pub struct SharedProjection<S>(pub Arc<S>);

impl<S: SharedFold + Any> Projection for SharedProjection<S> {
    fn name(&self) -> &str {
        SharedFold::name(&*self.0)
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        SharedFold::subscribes_to(&*self.0, event_type)
    }

    fn apply(&mut self, record: &EventRecord) {
        self.0.fold(record);
    }

    fn truncate(&mut self) {
        self.0.reset();
    }

    fn truncate_business(&mut self, business_id: BusinessId) {
        self.0.reset_business(business_id);
    }

    fn snapshot(&self, business_id: BusinessId) -> Result<Vec<u8>, ProjectionError> {
        self.0.snapshot_bytes(business_id)
    }

    fn restore(&mut self, business_id: BusinessId, bytes: &[u8]) -> Result<(), ProjectionError> {
        self.0.restore_bytes(business_id, bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self.0.as_ref()
    }
}

/// The full kernel state bundle.
#[derive(Debug)]
pub struct KernelState {
    pub lifecycle: Arc<LifecycleProjection>,
    pub identity: Arc<IdentityProjection>,
    pub feature_flags: Arc<FeatureFlagProjection>,
    pub resilience: Arc<ResilienceProjection>,
    pub compliance: Arc<ComplianceProjection>,
}

impl KernelState {
    pub fn new() -> Self {
        Self {
            lifecycle: Arc::new(LifecycleProjection::new()),
            identity: Arc::new(IdentityProjection::new()),
            feature_flags: Arc::new(FeatureFlagProjection::new()),
            resilience: Arc::new(ResilienceProjection::new()),
            compliance: Arc::new(ComplianceProjection::new()),
        }
    }

    /// Wrap each state as a runtime projection.
    pub fn projections(&self) -> Vec<Box<dyn Projection>> {
        vec![
            Box::new(SharedProjection(Arc::clone(&self.lifecycle))),
            Box::new(SharedProjection(Arc::clone(&self.identity))),
            Box::new(SharedProjection(Arc::clone(&self.feature_flags))),
            Box::new(SharedProjection(Arc::clone(&self.resilience))),
            Box::new(SharedProjection(Arc::clone(&self.compliance))),
        ]
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}
