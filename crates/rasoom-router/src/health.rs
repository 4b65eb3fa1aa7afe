use std::time::Duration;

use rasoom_core::Tier;
use serde::{Deserialize, Serialize};

const EWMA_ALPHA: f64 = 0.2;
const DEGRADED_ERROR_RATE: f64 = 0.05;
const UNREACHABLE_ERROR_RATE: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unreachable,
}

/// Delivery record of one member, as seen from the router.
#[derive(Clone, Debug, Default)]
pub(crate) struct AgentHealth {
    latency_ms: Option<f64>,
    delivered: u64,
    failed: u64,
    closed: bool,
}

impl AgentHealth {
    pub(crate) fn record_delivery(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.latency_ms = Some(match self.latency_ms {
            Some(prev) => prev + EWMA_ALPHA * (ms - prev),
            None => ms,
        });
        self.delivered += 1;
    }

    pub(crate) fn record_failure(&mut self, closed: bool) {
        self.failed += 1;
        self.closed |= closed;
    }

    pub(crate) fn error_rate(&self) -> f64 {
        let total = self.delivered + self.failed;
        if total == 0 {
            0.0
        } else {
            self.failed as f64 / total as f64
        }
    }

    pub(crate) fn status(&self) -> HealthStatus {
        let rate = self.error_rate();
        if self.closed || rate >= UNREACHABLE_ERROR_RATE {
            HealthStatus::Unreachable
        } else if rate >= DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub(crate) fn report(&self, agent_id: &str, tier: Tier, subscription_count: usize) -> HealthReport {
        HealthReport {
            agent_id: agent_id.to_string(),
            tier,
            status: self.status(),
            latency_ms: self.latency_ms.unwrap_or(0.0),
            error_rate: self.error_rate(),
            subscription_count,
            delivered: self.delivered,
            failed: self.failed,
        }
    }
}

/// Answer to `health.report`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub agent_id: String,
    pub tier: Tier,
    pub status: HealthStatus,
    /// Exponentially weighted mailbox latency.
    pub latency_ms: f64,
    pub error_rate: f64,
    pub subscription_count: usize,
    pub delivered: u64,
    pub failed: u64,
}
