//! Membership, subscriptions and dead letters.
//!
//! `RouterState` is owned by one router and only changed through these
//! methods; the router keeps it behind a single `RwLock` writer.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use rasoom_core::Tier;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{RouterConfig, TierLimits};
use crate::delivery::{DeadLetter, Delivery, Mailbox};
use crate::error::{Result, RouterError};
use crate::health::{AgentHealth, HealthReport, HealthStatus};
use crate::policy::{RouteDecision, RoutePattern};
use crate::subscription::{Subscription, Topic};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub agent_id: String,
    pub tier: Tier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    pub joined_ms: u64,
    pub last_seen_ms: u64,
}

struct Member {
    info: MemberInfo,
    mailbox: mpsc::Sender<Delivery>,
    health: AgentHealth,
}

/// A tier whose membership is below its configured minimum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Provisioning {
    pub tier: Tier,
    pub members: usize,
    pub min: usize,
    pub max: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub queued: u64,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub escalated: u64,
    pub cancelled: u64,
    pub batches: u64,
    pub subscriber_copies: u64,
}

pub(crate) type Recipient = (String, mpsc::Sender<Delivery>);

pub struct RouterState {
    limits: TierLimits,
    mailbox_capacity: usize,
    dead_letter_capacity: usize,
    members: BTreeMap<String, Member>,
    subscriptions: BTreeMap<Uuid, Subscription>,
    dead_letters: VecDeque<DeadLetter>,
    pub(crate) stats: RouterStats,
}

impl RouterState {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            limits: config.limits,
            mailbox_capacity: config.mailbox_capacity,
            dead_letter_capacity: config.dead_letter_capacity,
            members: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            dead_letters: VecDeque::new(),
            stats: RouterStats::default(),
        }
    }

    pub fn join(
        &mut self,
        agent_id: &str,
        tier: Tier,
        cluster_id: Option<String>,
        now_ms: u64,
    ) -> Result<Mailbox> {
        if agent_id.is_empty() {
            return Err(RouterError::UnknownAgent(String::new()));
        }
        if self.members.contains_key(agent_id) {
            return Err(RouterError::AlreadyJoined(agent_id.to_string()));
        }
        let max = self.limits.bounds(tier).max;
        if self.tier_count(tier) >= max {
            return Err(RouterError::CapacityExceeded { tier, max });
        }
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        self.members.insert(
            agent_id.to_string(),
            Member {
                info: MemberInfo {
                    agent_id: agent_id.to_string(),
                    tier,
                    cluster_id,
                    joined_ms: now_ms,
                    last_seen_ms: now_ms,
                },
                mailbox: tx,
                health: AgentHealth::default(),
            },
        );
        Ok(Mailbox::new(agent_id.to_string(), rx))
    }

    /// Remove a member and every subscription it holds.
    pub fn leave(&mut self, agent_id: &str) -> Result<MemberInfo> {
        let member = self
            .members
            .remove(agent_id)
            .ok_or_else(|| RouterError::UnknownAgent(agent_id.to_string()))?;
        self.subscriptions.retain(|_, s| s.agent_id != agent_id);
        Ok(member.info)
    }

    pub fn heartbeat(&mut self, agent_id: &str, now_ms: u64) -> Result<()> {
        let member = self.member_mut(agent_id)?;
        member.info.last_seen_ms = now_ms;
        Ok(())
    }

    pub fn member(&self, agent_id: &str) -> Option<&MemberInfo> {
        self.members.get(agent_id).map(|m| &m.info)
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.values().map(|m| m.info.clone()).collect()
    }

    pub fn tier_count(&self, tier: Tier) -> usize {
        self.members.values().filter(|m| m.info.tier == tier).count()
    }

    /// Tiers below their configured minimum.
    pub fn provisioning(&self) -> Vec<Provisioning> {
        Tier::ALL
            .iter()
            .map(|&tier| {
                let bounds = self.limits.bounds(tier);
                Provisioning {
                    tier,
                    members: self.tier_count(tier),
                    min: bounds.min,
                    max: bounds.max,
                }
            })
            .filter(|p| p.members < p.min)
            .collect()
    }

    fn member_mut(&mut self, agent_id: &str) -> Result<&mut Member> {
        self.members
            .get_mut(agent_id)
            .ok_or_else(|| RouterError::UnknownAgent(agent_id.to_string()))
    }

    /// Resolve who receives a message. The sender never receives its own
    /// message.
    pub(crate) fn recipients(
        &self,
        sender: &str,
        decision: &RouteDecision,
        agent_id: Option<&str>,
        cluster_id: Option<&str>,
    ) -> Result<Vec<Recipient>> {
        let target = decision.target;
        let wide = decision.escalated
            || matches!(
                decision.pattern,
                RoutePattern::Broadcast | RoutePattern::EmergencyBypass
            );

        if let (Some(agent), false) = (agent_id, wide) {
            let member = self
                .members
                .get(agent)
                .ok_or_else(|| RouterError::UnknownAgent(agent.to_string()))?;
            if member.info.tier != target {
                return Err(RouterError::PolicyViolation(format!(
                    "agent '{agent}' is {}, message targets {target}",
                    member.info.tier
                )));
            }
            if agent == sender {
                return Err(RouterError::NoRecipients {
                    target,
                    pattern: decision.pattern,
                });
            }
            return Ok(vec![(agent.to_string(), member.mailbox.clone())]);
        }

        let cluster = match (cluster_id, decision.pattern, wide) {
            (_, _, true) => None,
            (Some(c), ..) => Some(c),
            // cluster unicast without an address stays inside the sender's cluster
            (None, RoutePattern::ClusterUnicast, _) => self
                .member(sender)
                .and_then(|m| m.cluster_id.as_deref()),
            (None, ..) => None,
        };

        let out: Vec<Recipient> = self
            .members
            .values()
            .filter(|m| m.info.tier == target && m.info.agent_id != sender)
            .filter(|m| cluster.is_none_or(|c| m.info.cluster_id.as_deref() == Some(c)))
            .map(|m| (m.info.agent_id.clone(), m.mailbox.clone()))
            .collect();
        if out.is_empty() {
            return Err(RouterError::NoRecipients {
                target,
                pattern: decision.pattern,
            });
        }
        Ok(out)
    }

    pub fn subscribe(
        &mut self,
        agent_id: &str,
        topic: Topic,
        source_filter: Option<Tier>,
        now_ms: u64,
    ) -> Result<Uuid> {
        if !self.members.contains_key(agent_id) {
            return Err(RouterError::UnknownAgent(agent_id.to_string()));
        }
        let id = Uuid::new_v4();
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                agent_id: agent_id.to_string(),
                topic,
                source_filter,
                created_ms: now_ms,
            },
        );
        Ok(id)
    }

    /// Re-install a subscription loaded from storage. Skipped when its agent
    /// is not a member.
    pub fn restore_subscription(&mut self, subscription: Subscription) -> bool {
        if !self.members.contains_key(&subscription.agent_id) {
            return false;
        }
        self.subscriptions.insert(subscription.id, subscription);
        true
    }

    pub fn unsubscribe(&mut self, id: Uuid) -> Result<Subscription> {
        self.subscriptions
            .remove(&id)
            .ok_or(RouterError::UnknownSubscription(id))
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.values().cloned().collect()
    }

    /// One mailbox per subscribed agent that is not already a recipient.
    pub(crate) fn subscribers(
        &self,
        sender: &str,
        decision: &RouteDecision,
        recipients: &[String],
    ) -> Vec<Recipient> {
        let agents: BTreeSet<&str> = self
            .subscriptions
            .values()
            .filter(|s| s.accepts(decision.source, decision.target, decision.pattern))
            .map(|s| s.agent_id.as_str())
            .filter(|a| *a != sender && !recipients.iter().any(|r| r == a))
            .collect();
        agents
            .into_iter()
            .filter_map(|a| self.members.get(a))
            .map(|m| (m.info.agent_id.clone(), m.mailbox.clone()))
            .collect()
    }

    pub(crate) fn record_delivery(&mut self, agent_id: &str, latency: Duration) {
        if let Some(m) = self.members.get_mut(agent_id) {
            m.health.record_delivery(latency);
        }
    }

    /// Returns the new status when this failure moved the agent out of
    /// `Healthy` or further down.
    pub(crate) fn record_failure(&mut self, agent_id: &str, closed: bool) -> Option<HealthStatus> {
        let m = self.members.get_mut(agent_id)?;
        let before = m.health.status();
        m.health.record_failure(closed);
        let after = m.health.status();
        (after != before).then_some(after)
    }

    pub fn health(&self, agent_id: &str) -> Result<HealthReport> {
        let m = self
            .members
            .get(agent_id)
            .ok_or_else(|| RouterError::UnknownAgent(agent_id.to_string()))?;
        let subs = self
            .subscriptions
            .values()
            .filter(|s| s.agent_id == agent_id)
            .count();
        Ok(m.health.report(agent_id, m.info.tier, subs))
    }

    /// Oldest entries are evicted once the queue is full.
    pub(crate) fn push_dead_letter(&mut self, letter: DeadLetter) {
        while self.dead_letters.len() >= self.dead_letter_capacity {
            self.dead_letters.pop_front();
        }
        self.dead_letters.push_back(letter);
        self.stats.dead_lettered += 1;
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.iter().cloned().collect()
    }

    pub fn drain_dead_letters(&mut self) -> Vec<DeadLetter> {
        self.dead_letters.drain(..).collect()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}
