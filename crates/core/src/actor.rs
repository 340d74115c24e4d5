//! Actor model: who is issuing a command or emitting an event.
//!
//! Every event has exactly one actor. AI actors are advisory only and
//! cannot execute operational commands.

use serde::{Deserialize, Serialize};

/// Actor kind. Every command and event carries exactly one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    Human,
    System,
    Device,
    Ai,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Human => "HUMAN",
            ActorType::System => "SYSTEM",
            ActorType::Device => "DEVICE",
            ActorType::Ai => "AI",
        }
    }
}

impl core::fmt::Display for ActorType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actor requirement, declared per command type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRequirement {
    /// A resolved actor context must accompany the command.
    ActorRequired,
    /// The command may run without a human actor, but only as SYSTEM.
    SystemAllowed,
}

/// Resolved actor identity attached to a command.
///
/// Construction is the adapter's job (token resolution, device
/// registration, …); the kernel only consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl ActorContext {
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
        }
    }

    pub fn human(actor_id: impl Into<String>) -> Self {
        Self::new(ActorType::Human, actor_id)
    }

    pub fn system(actor_id: impl Into<String>) -> Self {
        Self::new(ActorType::System, actor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_type_serializes_screaming_snake() {
        assert_eq!(serde_json::to_string(&ActorType::Ai).unwrap(), "\"AI\"");
        assert_eq!(
            serde_json::to_string(&ActorType::Human).unwrap(),
            "\"HUMAN\""
        );
    }
}
