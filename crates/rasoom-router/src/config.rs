//! Router tuning. Every field has a development default; production
//! deployments are expected to set these explicitly in `rasoom.toml`.

use std::time::Duration;

use rasoom_core::Tier;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};
use crate::policy::RoutePattern;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBounds {
    pub min: usize,
    pub max: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimits {
    pub prime: TierBounds,
    pub domain: TierBounds,
    pub micro: TierBounds,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            prime: TierBounds { min: 36, max: 72 },
            domain: TierBounds { min: 144, max: 250 },
            micro: TierBounds { min: 0, max: 2500 },
        }
    }
}

impl TierLimits {
    pub fn bounds(&self, tier: Tier) -> TierBounds {
        match tier {
            Tier::Prime => self.prime,
            Tier::Domain => self.domain,
            Tier::Micro => self.micro,
        }
    }
}

/// Exponential backoff between delivery attempts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2,
            max_delay_ms: 50,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// Micro→Domain batches flush at `max_messages` or after `max_wait_ms`,
/// whichever comes first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationWindow {
    pub max_messages: usize,
    pub max_wait_ms: u64,
}

impl Default for AggregationWindow {
    fn default() -> Self {
        Self {
            max_messages: 32,
            max_wait_ms: 5,
        }
    }
}

/// Per-attempt delivery budget for each route pattern, in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyBudgets {
    pub prime_ms: u64,
    pub cluster_ms: u64,
    pub swarm_ms: u64,
    pub aggregate_ms: u64,
    pub escalation_ms: u64,
    pub emergency_ms: u64,
}

impl Default for LatencyBudgets {
    fn default() -> Self {
        Self {
            prime_ms: 1,
            cluster_ms: 5,
            swarm_ms: 10,
            aggregate_ms: 10,
            escalation_ms: 5,
            emergency_ms: 20,
        }
    }
}

impl LatencyBudgets {
    pub fn for_pattern(&self, pattern: RoutePattern) -> Duration {
        let ms = match pattern {
            RoutePattern::Unicast | RoutePattern::Broadcast => self.prime_ms,
            RoutePattern::ClusterMulticast | RoutePattern::ClusterUnicast => self.cluster_ms,
            RoutePattern::SwarmMulticast => self.swarm_ms,
            RoutePattern::Aggregate => self.aggregate_ms,
            RoutePattern::Escalation => self.escalation_ms,
            RoutePattern::EmergencyBypass => self.emergency_ms,
        };
        Duration::from_millis(ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub limits: TierLimits,
    pub retry: RetryPolicy,
    pub aggregation: AggregationWindow,
    pub budgets: LatencyBudgets,
    pub mailbox_capacity: usize,
    pub dead_letter_capacity: usize,
    pub event_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            limits: TierLimits::default(),
            retry: RetryPolicy::default(),
            aggregation: AggregationWindow::default(),
            budgets: LatencyBudgets::default(),
            mailbox_capacity: 256,
            dead_letter_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            let b = self.limits.bounds(tier);
            if b.min > b.max || b.max == 0 {
                return Err(RouterError::Config(format!(
                    "{tier} limits min {} / max {} are inconsistent",
                    b.min, b.max
                )));
            }
        }
        let r = &self.retry;
        if r.initial_delay_ms > r.max_delay_ms || r.multiplier.is_nan() || r.multiplier < 1.0 {
            return Err(RouterError::Config(
                "retry delays must grow from initial_delay_ms up to max_delay_ms".into(),
            ));
        }
        if self.aggregation.max_messages == 0 {
            return Err(RouterError::Config("aggregation.max_messages must be > 0".into()));
        }
        if self.mailbox_capacity == 0 || self.dead_letter_capacity == 0 || self.event_capacity == 0 {
            return Err(RouterError::Config("capacities must be > 0".into()));
        }
        Ok(())
    }
}
