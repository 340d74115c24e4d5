//! Feature flags — deterministic per-tenant engine toggles.
//!
//! Flags live per `(business_id, flag_key, branch_id?)`, are
//! last-write-wins, and are stored as events; the kernel projects them
//! into the provider the guard reads. Resolution is branch-scoped
//! first, then business-scoped. An engine that declares a flag key is
//! OFF until its flag is explicitly ENABLED for the tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bos_core::{BranchId, BusinessId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlagStatus {
    Enabled,
    Disabled,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagStatus::Enabled => "ENABLED",
            FlagStatus::Disabled => "DISABLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENABLED" => Some(FlagStatus::Enabled),
            "DISABLED" => Some(FlagStatus::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub flag_key: String,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub status: FlagStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl FeatureFlag {
    fn precedence_key(&self) -> (String, String, String, u8, String) {
        (
            self.flag_key.clone(),
            self.business_id.to_string(),
            self.branch_id.map(|b| b.to_string()).unwrap_or_default(),
            match self.status {
                FlagStatus::Enabled => 1,
                FlagStatus::Disabled => 2,
            },
            self.created_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        )
    }
}

/// Source of current flags for a business (kernel state projection).
pub trait FeatureFlagProvider: Send + Sync {
    fn flags_for_business(&self, business_id: BusinessId) -> Vec<FeatureFlag>;
}

/// Resolve the effective flag for `(flag_key, branch_id?)`.
///
/// Canonicalizes provider output deterministically: for a duplicate
/// scope key the last flag in stable sorted order wins, which makes
/// DISABLED override ENABLED at equal scope.
pub fn resolve_flag(
    flags: &[FeatureFlag],
    flag_key: &str,
    branch_id: Option<BranchId>,
) -> Option<FlagStatus> {
    let mut ordered: Vec<&FeatureFlag> = flags.iter().filter(|f| f.flag_key == flag_key).collect();
    ordered.sort_by_key(|f| f.precedence_key());

    let mut branch_status = None;
    let mut business_status = None;
    for flag in ordered {
        match flag.branch_id {
            None => business_status = Some(flag.status),
            Some(b) if Some(b) == branch_id => branch_status = Some(flag.status),
            Some(_) => {}
        }
    }

    branch_status.or(business_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(
        business_id: BusinessId,
        branch_id: Option<BranchId>,
        status: FlagStatus,
    ) -> FeatureFlag {
        FeatureFlag {
            flag_key: "ENABLE_CASH_ENGINE".to_string(),
            business_id,
            branch_id,
            status,
            created_at: None,
        }
    }

    #[test]
    fn branch_flag_overrides_business_flag() {
        let business = BusinessId::new();
        let branch = BranchId::new();
        let flags = vec![
            flag(business, None, FlagStatus::Enabled),
            flag(business, Some(branch), FlagStatus::Disabled),
        ];

        assert_eq!(
            resolve_flag(&flags, "ENABLE_CASH_ENGINE", Some(branch)),
            Some(FlagStatus::Disabled)
        );
        assert_eq!(
            resolve_flag(&flags, "ENABLE_CASH_ENGINE", None),
            Some(FlagStatus::Enabled)
        );
    }

    #[test]
    fn disabled_wins_over_enabled_at_equal_scope() {
        let business = BusinessId::new();
        let flags = vec![
            flag(business, None, FlagStatus::Disabled),
            flag(business, None, FlagStatus::Enabled),
        ];
        assert_eq!(
            resolve_flag(&flags, "ENABLE_CASH_ENGINE", None),
            Some(FlagStatus::Disabled)
        );
    }

    #[test]
    fn missing_flag_resolves_to_none() {
        assert_eq!(resolve_flag(&[], "ENABLE_CASH_ENGINE", None), None);
    }

    #[test]
    fn other_branch_flag_is_ignored() {
        let business = BusinessId::new();
        let flags = vec![flag(business, Some(BranchId::new()), FlagStatus::Enabled)];
        assert_eq!(
            resolve_flag(&flags, "ENABLE_CASH_ENGINE", Some(BranchId::new())),
            None
        );
    }
}
