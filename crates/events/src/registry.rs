//! Event type registry — the persistence allow-list.
//!
//! Controls which event types can be PERSISTED (the subscriber
//! registry controls which handlers listen). Registrations are
//! additive: a registered type can never be removed or changed;
//! breaking payload changes require a new `vN` type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Payload shape check for one event type. Returns a human-readable
/// reason on mismatch.
pub type PayloadValidator = Arc<dyn Fn(&JsonValue) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("event type '{0}' does not follow engine.domain.action.vN format")]
    InvalidFormat(String),

    #[error("event type '{0}' is already registered; breaking changes require a new vN")]
    AlreadyRegistered(String),

    #[error("event type '{0}' is not registered")]
    Unknown(String),

    #[error("payload for '{event_type}' failed validation: {reason}")]
    PayloadInvalid { event_type: String, reason: String },
}

/// Parsed shape of a valid event type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeName {
    pub engine: String,
    pub version: u32,
}

/// Parse and validate `engine.domain.action.vN`.
pub fn parse_event_type(event_type: &str) -> Result<EventTypeName, RegistryError> {
    let parts: Vec<&str> = event_type.split('.').collect();
    if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(RegistryError::InvalidFormat(event_type.to_string()));
    }

    let last = parts[parts.len() - 1];
    let version = last
        .strip_prefix('v')
        .and_then(|digits| digits.parse::<u32>().ok())
        .ok_or_else(|| RegistryError::InvalidFormat(event_type.to_string()))?;

    Ok(EventTypeName {
        engine: parts[0].to_string(),
        version,
    })
}

struct Registration {
    version: u32,
    validator: Option<PayloadValidator>,
}

/// Process-wide allow-list of persistable event types.
///
/// Append-only once bootstrapped; resolution is O(1).
#[derive(Default)]
pub struct EventTypeRegistry {
    types: RwLock<HashMap<String, Registration>>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event type without a payload validator.
    pub fn register(&self, event_type: &str) -> Result<(), RegistryError> {
        self.register_inner(event_type, None)
    }

    /// Register an event type with a payload-shape validator.
    pub fn register_with_validator(
        &self,
        event_type: &str,
        validator: PayloadValidator,
    ) -> Result<(), RegistryError> {
        self.register_inner(event_type, Some(validator))
    }

    fn register_inner(
        &self,
        event_type: &str,
        validator: Option<PayloadValidator>,
    ) -> Result<(), RegistryError> {
        let name = parse_event_type(event_type)?;

        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        if types.contains_key(event_type) {
            return Err(RegistryError::AlreadyRegistered(event_type.to_string()));
        }

        tracing::debug!(event_type, engine = %name.engine, "event type registered");
        types.insert(
            event_type.to_string(),
            Registration {
                version: name.version,
                validator,
            },
        );
        Ok(())
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(event_type)
    }

    /// Registered schema version for a type, if any.
    pub fn version_of(&self, event_type: &str) -> Option<u32> {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map(|r| r.version)
    }

    /// Check that a type exists and that the payload matches its
    /// registered shape.
    pub fn validate_payload(
        &self,
        event_type: &str,
        payload: &JsonValue,
    ) -> Result<(), RegistryError> {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        let registration = types
            .get(event_type)
            .ok_or_else(|| RegistryError::Unknown(event_type.to_string()))?;

        if let Some(validator) = &registration.validator {
            validator(payload).map_err(|reason| RegistryError::PayloadInvalid {
                event_type: event_type.to_string(),
                reason,
            })?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let types = self.types.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventTypeRegistry")
            .field("registered", &types.len())
            .finish()
    }
}
