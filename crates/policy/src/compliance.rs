//! Compliance profiles — declarative, deterministic rule evaluation.
//!
//! A profile is a versioned set of rules scoped to a business or a
//! branch. Rules are predicates over the command; BLOCK severity
//! rejects the command, WARN severity is collected as an advisory.
//! Evaluation order is fully deterministic: profiles canonicalize,
//! the effective profile is branch-first then business, and rules run
//! in sorted order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use bos_core::{BranchId, BusinessId};
use bos_events::CommandEnvelope;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleSeverity {
    Block,
    Warn,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    In,
    NotIn,
    Exists,
    NotExists,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Predicate over a command field.
///
/// `field` is a dotted path: a leading `payload.` segment descends
/// into the command payload; otherwise the path addresses envelope
/// fields (`command_type`, `branch_id`, `actor_type`, `actor_id`,
/// `source_engine`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub op: PredicateOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub rule_key: String,
    /// Either `COMMAND_TYPE:<glob>` or a named compliance target.
    pub applies_to: String,
    pub severity: RuleSeverity,
    pub predicate: Predicate,
    pub message: String,
}

impl ComplianceRule {
    fn sort_key(&self) -> (String, String, String) {
        (
            self.rule_key.clone(),
            self.applies_to.clone(),
            self.message.clone(),
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceProfile {
    pub profile_id: String,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub version: u32,
    pub status: ProfileStatus,
    pub rules: Vec<ComplianceRule>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Source of compliance profiles (kernel state projection).
pub trait ComplianceProvider: Send + Sync {
    fn profiles_for_business(&self, business_id: BusinessId) -> Vec<ComplianceProfile>;
}

/// Result of evaluating the active profile against a command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComplianceEvaluation {
    pub violations: Vec<JsonValue>,
    pub warnings: Vec<JsonValue>,
}

impl ComplianceEvaluation {
    pub fn allowed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Select the effective active profile: branch-scoped candidates win
/// over business-scoped ones; within a scope the highest
/// `(version, profile_id)` wins.
pub fn select_effective_profile<'a>(
    command: &CommandEnvelope,
    profiles: &'a [ComplianceProfile],
) -> Option<&'a ComplianceProfile> {
    let mut branch_candidates: Vec<&ComplianceProfile> = Vec::new();
    let mut business_candidates: Vec<&ComplianceProfile> = Vec::new();

    for profile in profiles {
        if profile.business_id != command.business_id || profile.status != ProfileStatus::Active {
            continue;
        }
        match profile.branch_id {
            None => business_candidates.push(profile),
            Some(b) if Some(b) == command.branch_id => branch_candidates.push(profile),
            Some(_) => {}
        }
    }

    let mut candidates = if command.branch_id.is_some() && !branch_candidates.is_empty() {
        branch_candidates
    } else {
        business_candidates
    };
    candidates.sort_by(|a, b| {
        (a.version, &a.profile_id).cmp(&(b.version, &b.profile_id))
    });
    candidates.pop()
}

/// Evaluate the effective profile's rules against a command.
pub fn evaluate(command: &CommandEnvelope, profiles: &[ComplianceProfile]) -> ComplianceEvaluation {
    let Some(profile) = select_effective_profile(command, profiles) else {
        return ComplianceEvaluation::default();
    };

    let mut ordered: Vec<&ComplianceRule> = profile.rules.iter().collect();
    ordered.sort_by_key(|r| r.sort_key());

    let mut evaluation = ComplianceEvaluation::default();
    for rule in ordered {
        if !rule_applies(rule, command) {
            continue;
        }
        if !predicate_matches(&rule.predicate, command) {
            continue;
        }

        let entry = json!({
            "rule_key": rule.rule_key,
            "severity": rule.severity,
            "message": rule.message,
            "applies_to": rule.applies_to,
            "profile_id": profile.profile_id,
        });
        match rule.severity {
            RuleSeverity::Block => evaluation.violations.push(entry),
            RuleSeverity::Warn => evaluation.warnings.push(entry),
        }
    }
    evaluation
}

fn rule_applies(rule: &ComplianceRule, command: &CommandEnvelope) -> bool {
    match rule.applies_to.strip_prefix("COMMAND_TYPE:") {
        Some(pattern) => glob_match(pattern, &command.command_type),
        None => false,
    }
}

/// Minimal glob: `*` matches any run of characters, everything else is
/// literal.
fn glob_match(pattern: &str, input: &str) -> bool {
    fn inner(p: &[u8], s: &[u8]) -> bool {
        match p.split_first() {
            None => s.is_empty(),
            Some((b'*', rest)) => {
                (0..=s.len()).any(|skip| inner(rest, &s[skip..]))
            }
            Some((c, rest)) => s.split_first().is_some_and(|(sc, srest)| sc == c && inner(rest, srest)),
        }
    }
    inner(pattern.as_bytes(), input.as_bytes())
}

fn resolve_field(command: &CommandEnvelope, path: &str) -> Option<JsonValue> {
    let mut segments = path.split('.');
    let head = segments.next()?;

    if head == "payload" {
        let mut current = &command.payload;
        for segment in segments {
            current = current.get(segment)?;
        }
        return Some(current.clone());
    }

    // Envelope fields; any trailing segments are invalid.
    if segments.next().is_some() {
        return None;
    }
    match head {
        "command_type" => Some(json!(command.command_type)),
        "source_engine" => Some(json!(command.source_engine)),
        "actor_id" => Some(json!(command.actor_id)),
        "actor_type" => Some(json!(command.actor_type.as_str())),
        "business_id" => Some(json!(command.business_id.to_string())),
        "branch_id" => command.branch_id.map(|b| json!(b.to_string())),
        _ => None,
    }
}

fn predicate_matches(predicate: &Predicate, command: &CommandEnvelope) -> bool {
    let actual = predicate
        .field
        .as_deref()
        .and_then(|path| resolve_field(command, path));

    match predicate.op {
        PredicateOp::Exists => return actual.is_some(),
        PredicateOp::NotExists => return actual.is_none(),
        _ => {}
    }

    let Some(actual) = actual else {
        return false;
    };
    let Some(expected) = predicate.value.as_ref() else {
        return false;
    };

    match predicate.op {
        PredicateOp::Eq => actual == *expected,
        PredicateOp::Ne => actual != *expected,
        PredicateOp::In => expected
            .as_array()
            .is_some_and(|items| items.contains(&actual)),
        PredicateOp::NotIn => expected
            .as_array()
            .is_some_and(|items| !items.contains(&actual)),
        PredicateOp::Gt | PredicateOp::Gte | PredicateOp::Lt | PredicateOp::Lte => {
            compare_numeric(&actual, expected)
                .map(|ordering| match predicate.op {
                    PredicateOp::Gt => ordering.is_gt(),
                    PredicateOp::Gte => ordering.is_ge(),
                    PredicateOp::Lt => ordering.is_lt(),
                    PredicateOp::Lte => ordering.is_le(),
                    _ => unreachable!(),
                })
                .unwrap_or(false)
        }
        PredicateOp::Exists | PredicateOp::NotExists => unreachable!(),
    }
}

/// Numeric comparison; decimal quantities carried as strings compare
/// through their parsed value.
fn compare_numeric(actual: &JsonValue, expected: &JsonValue) -> Option<std::cmp::Ordering> {
    let a = as_number(actual)?;
    let b = as_number(expected)?;
    a.partial_cmp(&b)
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}
