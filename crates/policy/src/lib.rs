//! `bos-policy` — the policy layer.
//!
//! Policies are pure functions over a command and the context they
//! are handed: no IO, no clock reads, no mutation. Composition is
//! short-circuit-on-first-rejection, in the fixed order the guard
//! pipeline defines. Every denial is a structured `Rejection` with an
//! authoritative `policy_name`.

pub mod anomaly;
pub mod compliance;
pub mod feature_flags;
pub mod guard;
pub mod ratelimit;
pub mod resilience;

pub use anomaly::{ActivityRecord, AnomalyDetector, AnomalyResult, AnomalySeverity, AnomalyThresholds};
pub use compliance::{
    ComplianceEvaluation, ComplianceProfile, ComplianceProvider, ComplianceRule, Predicate,
    PredicateOp, ProfileStatus, RuleSeverity,
};
pub use feature_flags::{resolve_flag, FeatureFlag, FeatureFlagProvider, FlagStatus};
pub use guard::{
    structural_guard, ActorDirectory, BranchDirectory, CommandPolicy, GuardError, GuardInput,
    GuardPipeline, GuardTrail, ResilienceProvider,
};
pub use ratelimit::{RateLimitResult, RateLimitTiers, RateLimiter};
pub use resilience::ResilienceMode;
