//! `bos-core` — kernel primitives.
//!
//! This crate defines **vocabulary**, not behavior: strongly-typed
//! identifiers, the actor and scope model, the closed rejection set,
//! the injectable clock, and tenant context. Multi-tenancy starts
//! here: `BusinessId` is mandatory everywhere downstream.

pub mod actor;
pub mod clock;
pub mod context;
pub mod id;
pub mod rejection;
pub mod scope;

pub use actor::{ActorContext, ActorRequirement, ActorType};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{BranchAccess, BusinessContext, TenantScope};
pub use id::{BranchId, BusinessId, CommandId, CorrelationId, EventId, RequestId};
pub use rejection::{IdParseError, Rejection, RejectionCode};
pub use scope::{LifecycleState, ScopeRequirement};
