//! Command outcomes.
//!
//! Every command produces exactly one outcome: `Accepted` with the
//! committed events or `Rejected` with a structured reason. There is
//! no third state and no silent path.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use bos_core::Rejection;

use crate::record::EventRecord;

/// Binary command decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Accepted { events: Vec<EventRecord> },
    Rejected { rejection: Rejection },
}

impl Outcome {
    pub fn accepted(events: Vec<EventRecord>) -> Self {
        Outcome::Accepted { events }
    }

    pub fn rejected(rejection: Rejection) -> Self {
        Outcome::Rejected { rejection }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected { .. })
    }

    pub fn events(&self) -> &[EventRecord] {
        match self {
            Outcome::Accepted { events } => events,
            Outcome::Rejected { .. } => &[],
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Accepted { .. } => None,
            Outcome::Rejected { rejection } => Some(rejection),
        }
    }

    /// Adapter-facing envelope: `{ok: true, data}` or
    /// `{ok: false, error: {code, message, policy_name, details?}}`.
    pub fn to_envelope(&self) -> JsonValue {
        match self {
            Outcome::Accepted { events } => json!({
                "ok": true,
                "data": { "events": events },
            }),
            Outcome::Rejected { rejection } => {
                let mut error = json!({
                    "code": rejection.code.as_str(),
                    "message": rejection.message,
                    "policy_name": rejection.policy_name,
                });
                if let Some(details) = &rejection.details {
                    error["details"] = details.clone();
                }
                json!({ "ok": false, "error": error })
            }
        }
    }
}
