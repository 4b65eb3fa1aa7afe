//! Topic subscriptions.
//!
//! A topic is `"<target-tier>.<pattern>"`: `domain.multicast` matches cluster
//! multicasts into the Domain tier, `micro.*` anything delivered to Micro,
//! `prime.esc*` any pattern starting with `esc`, and a bare `*` everything.

use std::fmt;
use std::str::FromStr;

use rasoom_core::Tier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RouterError;
use crate::policy::RoutePattern;

#[derive(Clone, Debug, PartialEq, Eq)]
enum PatternMatch {
    Any,
    Exact(String),
    Prefix(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic {
    tier: Option<Tier>,
    pattern: PatternMatch,
}

impl Topic {
    pub fn matches(&self, target: Tier, pattern: RoutePattern) -> bool {
        if self.tier.is_some_and(|t| t != target) {
            return false;
        }
        match &self.pattern {
            PatternMatch::Any => true,
            PatternMatch::Exact(name) => name == pattern.as_str(),
            PatternMatch::Prefix(prefix) => pattern.as_str().starts_with(prefix.as_str()),
        }
    }
}

impl FromStr for Topic {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Topic {
                tier: None,
                pattern: PatternMatch::Any,
            });
        }
        let invalid = || RouterError::InvalidTopic(s.to_string());
        let (tier, rest) = s.split_once('.').ok_or_else(invalid)?;
        let tier = tier.parse::<Tier>().map_err(|_| invalid())?;
        let pattern = match rest {
            "" => return Err(invalid()),
            "*" => PatternMatch::Any,
            p if p.ends_with('*') => {
                let prefix = &p[..p.len() - 1];
                if prefix.contains('*') {
                    return Err(invalid());
                }
                PatternMatch::Prefix(prefix.to_string())
            }
            p if p.contains('*') => return Err(invalid()),
            p => PatternMatch::Exact(p.to_string()),
        };
        Ok(Topic {
            tier: Some(tier),
            pattern,
        })
    }
}

impl TryFrom<String> for Topic {
    type Error = RouterError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Topic> for String {
    fn from(t: Topic) -> String {
        t.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(tier) = self.tier else {
            return f.write_str("*");
        };
        match &self.pattern {
            PatternMatch::Any => write!(f, "{tier}.*"),
            PatternMatch::Exact(p) => write!(f, "{tier}.{p}"),
            PatternMatch::Prefix(p) => write!(f, "{tier}.{p}*"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub agent_id: String,
    pub topic: Topic,
    /// Only copy messages sent from this tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filter: Option<Tier>,
    pub created_ms: u64,
}

impl Subscription {
    pub fn accepts(&self, source: Tier, target: Tier, pattern: RoutePattern) -> bool {
        self.source_filter.is_none_or(|f| f == source) && self.topic.matches(target, pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        s.parse().unwrap()
    }

    #[test]
    fn test_exact_topic() {
        let t = topic("domain.multicast");
        assert!(t.matches(Tier::Domain, RoutePattern::ClusterMulticast));
        assert!(!t.matches(Tier::Domain, RoutePattern::ClusterUnicast));
        assert!(!t.matches(Tier::Micro, RoutePattern::ClusterMulticast));
    }

    #[test]
    fn test_wildcards() {
        assert!(topic("*").matches(Tier::Micro, RoutePattern::SwarmMulticast));
        assert!(topic("micro.*").matches(Tier::Micro, RoutePattern::EmergencyBypass));
        assert!(!topic("micro.*").matches(Tier::Prime, RoutePattern::Broadcast));
        assert!(topic("prime.esc*").matches(Tier::Prime, RoutePattern::Escalation));
        assert!(!topic("prime.esc*").matches(Tier::Prime, RoutePattern::Unicast));
    }

    #[test]
    fn test_rejects_malformed_topics() {
        for bad in ["", "domain", "domain.", "galaxy.*", "domain.a*b*", "domain.*x"] {
            assert!(bad.parse::<Topic>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_display_roundtrips() {
        for s in ["*", "micro.*", "domain.multicast", "prime.esc*"] {
            assert_eq!(topic(s).to_string(), s);
        }
    }

    #[test]
    fn test_source_filter() {
        let sub = Subscription {
            id: Uuid::nil(),
            agent_id: "d-1".into(),
            topic: topic("domain.*"),
            source_filter: Some(Tier::Micro),
            created_ms: 0,
        };
        assert!(sub.accepts(Tier::Micro, Tier::Domain, RoutePattern::Aggregate));
        assert!(!sub.accepts(Tier::Prime, Tier::Domain, RoutePattern::ClusterMulticast));
    }
}
