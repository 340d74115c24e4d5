//! Audit and decision journal.
//!
//! Append-only evidence records with tenant scope: audit entries for
//! executed/rejected actions, consent records, and AI decision
//! entries. Nothing here is ever updated or deleted; consent
//! revocation and decision review append superseding records.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use bos_core::{ActorType, BranchId, BusinessId, EventId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Executed,
    Rejected,
    Error,
}

/// Immutable record of an action taken in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: uuid::Uuid,
    pub event_id: Option<EventId>,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub status: AuditStatus,
    pub occurred_at: DateTime<Utc>,
    pub metadata: JsonValue,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentType {
    BiometricCapture,
    DataProcessing,
    Marketing,
}

/// Immutable consent record. Revocation appends a new record with
/// `revoked_at` set; the original stays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub consent_id: uuid::Uuid,
    pub subject_id: String,
    pub consent_type: ConsentType,
    pub business_id: BusinessId,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ConsentRecord {
    /// Whether consent is valid at `now` (not revoked, not expired).
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        self.expires_at.is_none_or(|expires| now <= expires)
    }
}

/// AI decision simulation mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionMode {
    /// AI analyzes, a human decides.
    Advisory,
    /// AI prepares, a human approves.
    Assisted,
    /// AI executes within policy gates.
    Autonomous,
}

/// Human review state of AI advice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionOutcome {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

/// Immutable record of one AI advisory output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub decision_id: uuid::Uuid,
    pub business_id: BusinessId,
    pub engine: String,
    pub advice_type: String,
    pub advice: JsonValue,
    pub mode: DecisionMode,
    pub outcome: DecisionOutcome,
    pub actor_id: String,
    pub occurred_at: DateTime<Utc>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl DecisionEntry {
    pub fn is_pending(&self) -> bool {
        self.outcome == DecisionOutcome::Pending
    }
}

/// Append-only, tenant-scoped journal for audit evidence.
#[derive(Debug, Default)]
pub struct AuditJournal {
    audit: RwLock<Vec<AuditEntry>>,
    consent: RwLock<Vec<ConsentRecord>>,
    decisions: RwLock<Vec<DecisionEntry>>,
}

impl AuditJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_audit(&self, entry: AuditEntry) {
        self.audit
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn record_consent(&self, record: ConsentRecord) {
        self.consent
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn record_decision(&self, entry: DecisionEntry) {
        self.decisions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    /// Audit entries for one business, in append order.
    pub fn audit_for(&self, business_id: BusinessId) -> Vec<AuditEntry> {
        self.audit
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| entry.business_id == business_id)
            .cloned()
            .collect()
    }

    /// Consent records for one subject within one business.
    pub fn consent_for(&self, business_id: BusinessId, subject_id: &str) -> Vec<ConsentRecord> {
        self.consent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|record| {
                record.business_id == business_id && record.subject_id == subject_id
            })
            .cloned()
            .collect()
    }

    /// The effective consent decision: latest record wins.
    pub fn consent_valid(
        &self,
        business_id: BusinessId,
        subject_id: &str,
        consent_type: ConsentType,
        now: DateTime<Utc>,
    ) -> bool {
        self.consent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|record| {
                record.business_id == business_id
                    && record.subject_id == subject_id
                    && record.consent_type == consent_type
            })
            .next_back()
            .is_some_and(|record| record.is_valid(now))
    }

    pub fn decisions_for(&self, business_id: BusinessId) -> Vec<DecisionEntry> {
        self.decisions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|entry| entry.business_id == business_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, seconds).unwrap()
    }

    fn consent(
        business_id: BusinessId,
        granted_at: DateTime<Utc>,
        revoked_at: Option<DateTime<Utc>>,
    ) -> ConsentRecord {
        ConsentRecord {
            consent_id: uuid::Uuid::new_v4(),
            subject_id: "subject-1".to_string(),
            consent_type: ConsentType::DataProcessing,
            business_id,
            granted_at,
            expires_at: None,
            revoked_at,
        }
    }

    #[test]
    fn journal_reads_are_tenant_scoped() {
        let journal = AuditJournal::new();
        let business_a = BusinessId::new();
        let business_b = BusinessId::new();
        journal.record_audit(AuditEntry {
            entry_id: uuid::Uuid::new_v4(),
            event_id: None,
            actor_type: ActorType::Human,
            actor_id: "u-1".to_string(),
            action: "cash.drawer.open.request".to_string(),
            resource_type: "drawer".to_string(),
            resource_id: "d-1".to_string(),
            business_id: business_a,
            branch_id: None,
            status: AuditStatus::Executed,
            occurred_at: t(0),
            metadata: serde_json::json!({}),
        });

        assert_eq!(journal.audit_for(business_a).len(), 1);
        assert!(journal.audit_for(business_b).is_empty());
    }

    #[test]
    fn consent_revocation_appends_and_supersedes() {
        let journal = AuditJournal::new();
        let business = BusinessId::new();

        journal.record_consent(consent(business, t(0), None));
        assert!(journal.consent_valid(business, "subject-1", ConsentType::DataProcessing, t(5)));

        // Revocation is a new record; the original stays.
        journal.record_consent(consent(business, t(0), Some(t(10))));
        assert!(!journal.consent_valid(
            business,
            "subject-1",
            ConsentType::DataProcessing,
            t(20)
        ));
        assert_eq!(journal.consent_for(business, "subject-1").len(), 2);
    }

    #[test]
    fn expired_consent_is_invalid() {
        let journal = AuditJournal::new();
        let business = BusinessId::new();
        let mut record = consent(business, t(0), None);
        record.expires_at = Some(t(10));
        journal.record_consent(record);

        assert!(journal.consent_valid(business, "subject-1", ConsentType::DataProcessing, t(5)));
        assert!(!journal.consent_valid(
            business,
            "subject-1",
            ConsentType::DataProcessing,
            t(15)
        ));
    }
}
