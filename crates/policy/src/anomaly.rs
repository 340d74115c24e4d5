//! Rule-based anomaly detection.
//!
//! No ML — deterministic rules with explicit thresholds over a
//! sliding activity window. Time comes from the caller's clock; the
//! detector never reads wall time.
//!
//! Rules:
//! 1. High command velocity from a single actor (WARN)
//! 2. Rapid branch switching within a short window (BLOCK)
//! 3. Repeated rejections of the same command type (WARN)

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use bos_core::{BranchId, BusinessId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnomalySeverity {
    /// Log only.
    Info,
    /// Log and flag for review.
    Warn,
    /// Log and deny the command.
    Block,
}

/// Result of an anomaly check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalyResult {
    pub detected: bool,
    pub anomaly_type: String,
    pub severity: AnomalySeverity,
    pub description: String,
}

impl AnomalyResult {
    pub fn clean() -> Self {
        Self {
            detected: false,
            anomaly_type: String::new(),
            severity: AnomalySeverity::Info,
            description: String::new(),
        }
    }

    pub fn blocks(&self) -> bool {
        self.detected && self.severity == AnomalySeverity::Block
    }
}

/// A single command activity record for window tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub actor_id: String,
    pub business_id: BusinessId,
    pub branch_id: Option<BranchId>,
    pub command_type: String,
    pub occurred_at: DateTime<Utc>,
    pub was_rejected: bool,
}

/// Detection thresholds.
#[derive(Debug, Copy, Clone)]
pub struct AnomalyThresholds {
    pub high_velocity: usize,
    pub rapid_branch_switch: usize,
    pub rapid_branch_window: Duration,
    pub repeated_rejections: usize,
    pub window: Duration,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            high_velocity: 100,
            rapid_branch_switch: 3,
            rapid_branch_window: Duration::seconds(30),
            repeated_rejections: 5,
            window: Duration::seconds(60),
        }
    }
}

type ActorKey = (String, BusinessId);

/// Deterministic, window-based anomaly detector.
#[derive(Debug)]
pub struct AnomalyDetector {
    thresholds: AnomalyThresholds,
    activities: Mutex<HashMap<ActorKey, VecDeque<ActivityRecord>>>,
}

impl AnomalyDetector {
    pub fn new(thresholds: AnomalyThresholds) -> Self {
        Self {
            thresholds,
            activities: Mutex::new(HashMap::new()),
        }
    }

    /// Record one command activity for window tracking.
    pub fn record_activity(&self, activity: ActivityRecord) {
        let key = (activity.actor_id.clone(), activity.business_id);
        let mut activities = self.activities.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = activities.entry(key).or_default();

        // Keep 2x window so branch-switch analysis has context.
        let cutoff = activity.occurred_at - (self.thresholds.window * 2);
        bucket.push_back(activity);
        while bucket.front().is_some_and(|a| a.occurred_at < cutoff) {
            bucket.pop_front();
        }
    }

    /// Run all rules; returns the highest-severity finding, or clean.
    pub fn check(
        &self,
        actor_id: &str,
        business_id: BusinessId,
        branch_id: Option<BranchId>,
        command_type: &str,
        now: DateTime<Utc>,
    ) -> AnomalyResult {
        let activities = self.activities.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - self.thresholds.window;
        let recent: Vec<&ActivityRecord> = activities
            .get(&(actor_id.to_string(), business_id))
            .map(|bucket| bucket.iter().filter(|a| a.occurred_at >= cutoff).collect())
            .unwrap_or_default();

        let mut findings = Vec::new();

        if recent.len() >= self.thresholds.high_velocity {
            findings.push(AnomalyResult {
                detected: true,
                anomaly_type: "HIGH_VELOCITY".to_string(),
                severity: AnomalySeverity::Warn,
                description: format!(
                    "actor {actor_id} issued {} commands in the window (threshold {})",
                    recent.len(),
                    self.thresholds.high_velocity
                ),
            });
        }

        if let Some(current_branch) = branch_id {
            let switch_cutoff = now - self.thresholds.rapid_branch_window;
            let mut branches: Vec<BranchId> = recent
                .iter()
                .filter(|a| a.occurred_at >= switch_cutoff)
                .filter_map(|a| a.branch_id)
                .collect();
            branches.push(current_branch);
            branches.sort_unstable();
            branches.dedup();

            if branches.len() > self.thresholds.rapid_branch_switch {
                findings.push(AnomalyResult {
                    detected: true,
                    anomaly_type: "RAPID_BRANCH_SWITCH".to_string(),
                    severity: AnomalySeverity::Block,
                    description: format!(
                        "actor {actor_id} touched {} branches within {}s (threshold {})",
                        branches.len(),
                        self.thresholds.rapid_branch_window.num_seconds(),
                        self.thresholds.rapid_branch_switch
                    ),
                });
            }
        }

        let rejections = recent
            .iter()
            .filter(|a| a.was_rejected && a.command_type == command_type)
            .count();
        if rejections >= self.thresholds.repeated_rejections {
            findings.push(AnomalyResult {
                detected: true,
                anomaly_type: "REPEATED_REJECTIONS".to_string(),
                severity: AnomalySeverity::Warn,
                description: format!(
                    "actor {actor_id} had {rejections} rejections for '{command_type}' in the window (threshold {})",
                    self.thresholds.repeated_rejections
                ),
            });
        }

        findings
            .into_iter()
            .max_by_key(|f| f.severity)
            .unwrap_or_else(AnomalyResult::clean)
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(AnomalyThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    fn activity(
        business_id: BusinessId,
        branch_id: Option<BranchId>,
        at: DateTime<Utc>,
        was_rejected: bool,
    ) -> ActivityRecord {
        ActivityRecord {
            actor_id: "u-1".to_string(),
            business_id,
            branch_id,
            command_type: "cash.drawer.open.request".to_string(),
            occurred_at: at,
            was_rejected,
        }
    }

    #[test]
    fn clean_for_quiet_actor() {
        let detector = AnomalyDetector::default();
        let result = detector.check("u-1", BusinessId::new(), None, "x.y.z.request", t0());
        assert!(!result.detected);
    }

    #[test]
    fn rapid_branch_switching_blocks() {
        let detector = AnomalyDetector::new(AnomalyThresholds {
            rapid_branch_switch: 2,
            ..Default::default()
        });
        let business = BusinessId::new();

        for i in 0..2 {
            detector.record_activity(activity(
                business,
                Some(BranchId::new()),
                t0() + Duration::seconds(i),
                false,
            ));
        }

        let result = detector.check(
            "u-1",
            business,
            Some(BranchId::new()),
            "cash.drawer.open.request",
            t0() + Duration::seconds(3),
        );
        assert!(result.blocks());
        assert_eq!(result.anomaly_type, "RAPID_BRANCH_SWITCH");
    }

    #[test]
    fn repeated_rejections_warn_but_do_not_block() {
        let detector = AnomalyDetector::new(AnomalyThresholds {
            repeated_rejections: 3,
            ..Default::default()
        });
        let business = BusinessId::new();

        for i in 0..3 {
            detector.record_activity(activity(
                business,
                None,
                t0() + Duration::seconds(i),
                true,
            ));
        }

        let result = detector.check(
            "u-1",
            business,
            None,
            "cash.drawer.open.request",
            t0() + Duration::seconds(5),
        );
        assert!(result.detected);
        assert_eq!(result.severity, AnomalySeverity::Warn);
        assert!(!result.blocks());
    }

    #[test]
    fn old_activity_falls_out_of_the_window() {
        let detector = AnomalyDetector::new(AnomalyThresholds {
            high_velocity: 2,
            ..Default::default()
        });
        let business = BusinessId::new();

        detector.record_activity(activity(business, None, t0(), false));
        detector.record_activity(activity(business, None, t0() + Duration::seconds(1), false));

        let much_later = t0() + Duration::seconds(120);
        let result = detector.check("u-1", business, None, "x.y.z.request", much_later);
        assert!(!result.detected);
    }

    #[test]
    fn highest_severity_wins() {
        let detector = AnomalyDetector::new(AnomalyThresholds {
            high_velocity: 1,
            rapid_branch_switch: 1,
            ..Default::default()
        });
        let business = BusinessId::new();
        detector.record_activity(activity(business, Some(BranchId::new()), t0(), false));

        let result = detector.check(
            "u-1",
            business,
            Some(BranchId::new()),
            "x.y.z.request",
            t0() + Duration::seconds(1),
        );
        assert_eq!(result.severity, AnomalySeverity::Block);
    }
}
