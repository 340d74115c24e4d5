//! Resilience modes.
//!
//! Coarse operating state gating writes: NORMAL → DEGRADED →
//! READ_ONLY. Transitions are events; the kernel projects them into
//! the current per-business mode the guard pipeline reads.

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResilienceMode {
    /// All operations allowed.
    #[default]
    Normal,
    /// Only the declared essential command subset passes.
    Degraded,
    /// No writes; reads only.
    ReadOnly,
}

impl ResilienceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResilienceMode::Normal => "NORMAL",
            ResilienceMode::Degraded => "DEGRADED",
            ResilienceMode::ReadOnly => "READ_ONLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NORMAL" => Some(ResilienceMode::Normal),
            "DEGRADED" => Some(ResilienceMode::Degraded),
            "READ_ONLY" => Some(ResilienceMode::ReadOnly),
            _ => None,
        }
    }

    pub fn allows_all_writes(&self) -> bool {
        matches!(self, ResilienceMode::Normal)
    }
}

impl core::fmt::Display for ResilienceMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
