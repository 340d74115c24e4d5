//! Command rate limiting.
//!
//! Sliding 60-second window per `(actor_id, business_id)`; the limit
//! tier is selected by actor type. Deterministic over the injected
//! clock — the limiter never reads wall time itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use bos_core::{ActorType, BusinessId};

/// Per-actor-type command budgets per window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateLimitTiers {
    pub human: u32,
    pub device: u32,
    pub system: u32,
    pub ai: u32,
}

impl Default for RateLimitTiers {
    fn default() -> Self {
        Self {
            human: 120,
            device: 240,
            system: 600,
            ai: 60,
        }
    }
}

impl RateLimitTiers {
    pub fn limit_for(&self, actor_type: ActorType) -> u32 {
        match actor_type {
            ActorType::Human => self.human,
            ActorType::Device => self.device,
            ActorType::System => self.system,
            ActorType::Ai => self.ai,
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
}

type ActorKey = (String, BusinessId);

/// Sliding-window command rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    tiers: RateLimitTiers,
    activity: Mutex<HashMap<ActorKey, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(tiers: RateLimitTiers) -> Self {
        Self {
            window: Duration::seconds(60),
            tiers,
            activity: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether the actor is within its window budget at `now`.
    pub fn check(
        &self,
        actor_id: &str,
        business_id: BusinessId,
        actor_type: ActorType,
        now: DateTime<Utc>,
    ) -> RateLimitResult {
        let limit = self.tiers.limit_for(actor_type);
        let cutoff = now - self.window;

        let activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        let used = activity
            .get(&(actor_id.to_string(), business_id))
            .map(|bucket| bucket.iter().filter(|t| **t >= cutoff).count() as u32)
            .unwrap_or(0);

        RateLimitResult {
            allowed: used < limit,
            remaining: limit.saturating_sub(used),
            limit,
        }
    }

    /// Record one command at `now`, evicting entries outside the window.
    pub fn record(&self, actor_id: &str, business_id: BusinessId, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = activity
            .entry((actor_id.to_string(), business_id))
            .or_default();
        bucket.push_back(now);
        while bucket.front().is_some_and(|t| *t < cutoff) {
            bucket.pop_front();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitTiers::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn allows_until_tier_limit() {
        let limiter = RateLimiter::new(RateLimitTiers {
            human: 3,
            ..Default::default()
        });
        let business = BusinessId::new();

        for _ in 0..3 {
            assert!(limiter.check("u-1", business, ActorType::Human, t0()).allowed);
            limiter.record("u-1", business, t0());
        }

        let result = limiter.check("u-1", business, ActorType::Human, t0());
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn window_slides_with_injected_time() {
        let limiter = RateLimiter::new(RateLimitTiers {
            human: 1,
            ..Default::default()
        });
        let business = BusinessId::new();

        limiter.record("u-1", business, t0());
        assert!(!limiter.check("u-1", business, ActorType::Human, t0()).allowed);

        let later = t0() + Duration::seconds(61);
        assert!(limiter.check("u-1", business, ActorType::Human, later).allowed);
    }

    #[test]
    fn buckets_are_per_actor_and_business() {
        let limiter = RateLimiter::new(RateLimitTiers {
            human: 1,
            ..Default::default()
        });
        let business_a = BusinessId::new();
        let business_b = BusinessId::new();

        limiter.record("u-1", business_a, t0());
        assert!(!limiter.check("u-1", business_a, ActorType::Human, t0()).allowed);
        assert!(limiter.check("u-1", business_b, ActorType::Human, t0()).allowed);
        assert!(limiter.check("u-2", business_a, ActorType::Human, t0()).allowed);
    }
}
