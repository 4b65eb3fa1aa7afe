//! Route selection. Pure: the same tiers and flags always produce the same
//! decision, so `policy.check` can answer without touching router state.

use std::fmt;
use std::str::FromStr;

use rasoom_core::{BYPASS_PRIORITY, DEFAULT_PRIORITY, FrameHeader, Tier};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutePattern {
    Unicast,
    Broadcast,
    ClusterMulticast,
    ClusterUnicast,
    SwarmMulticast,
    Aggregate,
    EmergencyBypass,
    Escalation,
}

impl RoutePattern {
    /// Short name used in subscription topics, e.g. `domain.multicast`.
    pub fn as_str(self) -> &'static str {
        match self {
            RoutePattern::Unicast => "unicast",
            RoutePattern::Broadcast => "broadcast",
            RoutePattern::ClusterMulticast => "multicast",
            RoutePattern::ClusterUnicast => "cluster",
            RoutePattern::SwarmMulticast => "swarm",
            RoutePattern::Aggregate => "aggregate",
            RoutePattern::EmergencyBypass => "bypass",
            RoutePattern::Escalation => "escalation",
        }
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutePattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ALL_PATTERNS
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown route pattern '{s}'"))
    }
}

const ALL_PATTERNS: [RoutePattern; 8] = [
    RoutePattern::Unicast,
    RoutePattern::Broadcast,
    RoutePattern::ClusterMulticast,
    RoutePattern::ClusterUnicast,
    RoutePattern::SwarmMulticast,
    RoutePattern::Aggregate,
    RoutePattern::EmergencyBypass,
    RoutePattern::Escalation,
];

/// The frame properties routing policy looks at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFlags {
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub escalate: bool,
    #[serde(default)]
    pub bypass: bool,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Default for PayloadFlags {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            escalate: false,
            bypass: false,
        }
    }
}

impl PayloadFlags {
    pub fn from_header(header: &FrameHeader) -> Self {
        Self {
            priority: header.priority,
            escalate: header.flags.escalate,
            bypass: header.flags.bypass,
        }
    }

    fn urgent(&self) -> bool {
        self.priority >= BYPASS_PRIORITY
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub pattern: RoutePattern,
    pub source: Tier,
    /// Tier that receives the message. Differs from the requested target
    /// when the message is escalated.
    pub target: Tier,
    /// High ambiguity met high priority: sent to Prime for clarification.
    pub escalated: bool,
}

/// Pick the route for a message. `addressed` is true when the sender named a
/// specific recipient agent.
pub fn decide(source: Tier, target: Tier, flags: PayloadFlags, addressed: bool) -> Result<RouteDecision> {
    if flags.escalate && flags.urgent() {
        return Ok(RouteDecision {
            pattern: RoutePattern::Escalation,
            source,
            target: Tier::Prime,
            escalated: true,
        });
    }
    let route = |pattern| RouteDecision {
        pattern,
        source,
        target,
        escalated: false,
    };

    if flags.bypass {
        if !(flags.urgent() || flags.escalate) {
            return Err(RouterError::PolicyViolation(format!(
                "emergency bypass needs priority >= {BYPASS_PRIORITY} or escalation (got priority {})",
                flags.priority
            )));
        }
        if source == Tier::Micro {
            return Err(RouterError::PolicyViolation(
                "micro agents cannot request emergency bypass".into(),
            ));
        }
        return Ok(route(RoutePattern::EmergencyBypass));
    }

    let pattern = match (source, target) {
        (Tier::Prime, Tier::Prime) if addressed => RoutePattern::Unicast,
        (Tier::Prime, Tier::Prime) => RoutePattern::Broadcast,
        (Tier::Prime, Tier::Domain) => RoutePattern::ClusterMulticast,
        (Tier::Domain, Tier::Domain) => RoutePattern::ClusterUnicast,
        (Tier::Domain, Tier::Micro) => RoutePattern::SwarmMulticast,
        (Tier::Micro, Tier::Domain) => RoutePattern::Aggregate,
        (Tier::Domain, Tier::Prime) => RoutePattern::Escalation,
        (Tier::Prime, Tier::Micro) if flags.urgent() || flags.escalate => {
            RoutePattern::EmergencyBypass
        }
        (Tier::Prime, Tier::Micro) => {
            return Err(RouterError::PolicyViolation(format!(
                "prime to micro is emergency-only: needs priority >= {BYPASS_PRIORITY} or escalation"
            )));
        }
        (Tier::Micro, _) => {
            return Err(RouterError::PolicyViolation(format!(
                "micro agents may only report to domain, not {target}"
            )));
        }
    };
    Ok(route(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(priority: u8) -> PayloadFlags {
        PayloadFlags {
            priority,
            ..Default::default()
        }
    }

    fn pattern(source: Tier, target: Tier, f: PayloadFlags, addressed: bool) -> RoutePattern {
        decide(source, target, f, addressed).unwrap().pattern
    }

    #[test]
    fn test_route_table() {
        use RoutePattern::*;
        use Tier::*;
        let f = flags(5);
        assert_eq!(pattern(Prime, Prime, f, true), Unicast);
        assert_eq!(pattern(Prime, Prime, f, false), Broadcast);
        assert_eq!(pattern(Prime, Domain, f, false), ClusterMulticast);
        assert_eq!(pattern(Domain, Domain, f, true), ClusterUnicast);
        assert_eq!(pattern(Domain, Micro, f, false), SwarmMulticast);
        assert_eq!(pattern(Micro, Domain, f, false), Aggregate);
        assert_eq!(pattern(Domain, Prime, f, false), Escalation);
        assert_eq!(pattern(Prime, Micro, flags(9), false), EmergencyBypass);
    }

    #[test]
    fn test_prime_to_micro_needs_urgency() {
        let err = decide(Tier::Prime, Tier::Micro, flags(8), false).unwrap_err();
        assert!(matches!(err, RouterError::PolicyViolation(_)));
        let escalating = PayloadFlags {
            escalate: true,
            ..flags(3)
        };
        assert_eq!(
            pattern(Tier::Prime, Tier::Micro, escalating, false),
            RoutePattern::EmergencyBypass
        );
    }

    #[test]
    fn test_micro_cannot_skip_domain() {
        for target in [Tier::Prime, Tier::Micro] {
            assert!(matches!(
                decide(Tier::Micro, target, flags(10), true),
                Err(RouterError::PolicyViolation(_))
            ));
        }
    }

    #[test]
    fn test_bypass_request_checked() {
        let bypass = |priority| PayloadFlags {
            bypass: true,
            ..flags(priority)
        };
        assert!(matches!(
            decide(Tier::Domain, Tier::Micro, bypass(5), false),
            Err(RouterError::PolicyViolation(_))
        ));
        assert_eq!(
            pattern(Tier::Domain, Tier::Micro, bypass(9), false),
            RoutePattern::EmergencyBypass
        );
        assert!(decide(Tier::Micro, Tier::Domain, bypass(10), false).is_err());
    }

    #[test]
    fn test_ambiguous_urgent_message_escalates_to_prime() {
        let f = PayloadFlags {
            priority: 9,
            escalate: true,
            bypass: false,
        };
        let d = decide(Tier::Domain, Tier::Micro, f, false).unwrap();
        assert_eq!(d.pattern, RoutePattern::Escalation);
        assert_eq!(d.target, Tier::Prime);
        assert!(d.escalated);
        // escalation flag alone does not reroute
        let calm = decide(Tier::Domain, Tier::Micro, PayloadFlags { escalate: true, ..flags(4) }, false).unwrap();
        assert_eq!(calm.pattern, RoutePattern::SwarmMulticast);
        assert!(!calm.escalated);
    }

    #[test]
    fn test_pattern_names_parse_back() {
        for p in ALL_PATTERNS {
            assert_eq!(p.as_str().parse::<RoutePattern>().unwrap(), p);
        }
        assert!("teleport".parse::<RoutePattern>().is_err());
    }
}
