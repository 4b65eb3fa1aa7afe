//! ProtocolAdapter: the transport-agnostic function surface over a router.
//!
//! Built-ins are served here; catalog entries contributed by an external
//! registry are listed but have no handler. Legacy text commands enter
//! through `send_command`, which skips normalization and tree induction.

use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use rasoom_core::{DEFAULT_PRIORITY, Envelope, Pipeline, Tier};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{ExternalRegistry, FunctionCatalog, MergeReport};
use crate::error::{Result, RouterError};
use crate::health::HealthReport;
use crate::policy::{self, PayloadFlags, RoutePattern};
use crate::router::{Outbound, SendReceipt, TierRouter};

/// `[@tier] [!priority] [>agent] text`, e.g. `@domain !7 >d-12 rebalance`.
static LEGACY_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:@(?P<tier>prime|domain|micro)\s+)?(?:!(?P<priority>10|[1-9])\s+)?(?:>(?P<agent>[\w.-]+)\s+)?(?P<text>\S.*?)\s*$",
    )
    .unwrap()
});

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub sender_id: String,
    pub tier_target: Tier,
    /// Hex-encoded frame.
    pub frame: String,
    pub priority: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub agent_id: String,
    pub topic: String,
    #[serde(default)]
    pub tier_filter: Option<Tier>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheckRequest {
    /// Agent id or tier name.
    pub sender: String,
    /// Agent id or tier name.
    pub receiver: String,
    #[serde(default)]
    pub payload_flags: PayloadFlags,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RoutePattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Tier>,
    #[serde(default)]
    pub escalated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyVerdict {
    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            route: None,
            target: None,
            escalated: false,
            reason: Some(reason.into()),
        }
    }
}

/// Immediate answer to a send: where the message is going.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAck {
    pub message_id: Uuid,
    pub route: RoutePattern,
    pub target: Tier,
    pub recipients: usize,
    pub escalated: bool,
}

impl From<&SendReceipt> for SendAck {
    fn from(r: &SendReceipt) -> Self {
        Self {
            message_id: r.message_id,
            route: r.decision.pattern,
            target: r.decision.target,
            recipients: r.recipients,
            escalated: r.decision.escalated,
        }
    }
}

/// A parsed legacy text command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyCommand {
    pub tier: Tier,
    pub priority: u8,
    pub agent_id: Option<String>,
    pub text: String,
}

impl LegacyCommand {
    /// Unprefixed commands go to Prime at the default priority.
    pub fn parse(line: &str) -> Result<Self> {
        let caps = LEGACY_COMMAND.captures(line).ok_or_else(|| {
            RouterError::Pipeline(rasoom_core::PipelineError::MalformedInput(
                "empty command".into(),
            ))
        })?;
        let tier = match caps.name("tier") {
            Some(m) => m
                .as_str()
                .parse()
                .map_err(|e: String| RouterError::PolicyViolation(e))?,
            None => Tier::Prime,
        };
        let priority = caps
            .name("priority")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(DEFAULT_PRIORITY);
        Ok(Self {
            tier,
            priority,
            agent_id: caps.name("agent").map(|m| m.as_str().to_string()),
            text: caps
                .name("text")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
    }
}

#[derive(Clone)]
pub struct ProtocolAdapter {
    pipeline: Arc<Pipeline>,
    router: TierRouter,
    catalog: FunctionCatalog,
    merge_report: MergeReport,
}

impl ProtocolAdapter {
    pub fn new(pipeline: Pipeline, router: TierRouter, registry: &ExternalRegistry) -> Self {
        let (catalog, merge_report) = FunctionCatalog::with_registry(registry);
        Self {
            pipeline: Arc::new(pipeline),
            router,
            catalog,
            merge_report,
        }
    }

    pub fn catalog(&self) -> &FunctionCatalog {
        &self.catalog
    }

    pub fn merge_report(&self) -> &MergeReport {
        &self.merge_report
    }

    pub fn router(&self) -> &TierRouter {
        &self.router
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Decode and verify a frame, then hand it to the router. The claimed
    /// sender, tier and priority must agree with the frame itself.
    pub async fn send(&self, request: &SendRequest) -> Result<SendReceipt> {
        let frame = hex::decode(request.frame.trim())
            .map_err(|e| RouterError::InvalidFrame(e.to_string()))?;
        self.send_frame(&request.sender_id, request.tier_target, request.priority, Bytes::from(frame))
            .await
    }

    pub async fn send_frame(
        &self,
        sender_id: &str,
        tier_target: Tier,
        priority: u8,
        frame: Bytes,
    ) -> Result<SendReceipt> {
        let decoded = self.pipeline.decode(&frame)?;
        let header = &decoded.header;
        if header.source_id != sender_id {
            return Err(RouterError::PolicyViolation(format!(
                "sender '{sender_id}' does not match frame source '{}'",
                header.source_id
            )));
        }
        if header.target_tier != tier_target {
            return Err(RouterError::PolicyViolation(format!(
                "requested tier {tier_target} but frame targets {}",
                header.target_tier
            )));
        }
        if header.priority != priority {
            return Err(RouterError::PolicyViolation(format!(
                "requested priority {priority} but frame carries {}",
                header.priority
            )));
        }
        self.router.send(Outbound::from_decoded(&decoded, frame)).await
    }

    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<Uuid> {
        self.router
            .subscribe(&request.agent_id, &request.topic, request.tier_filter)
            .await
    }

    pub async fn health_report(&self, agent_id: &str) -> Result<HealthReport> {
        self.router.health_report(agent_id).await
    }

    /// Never fails: unknown parties and violations come back as a denial.
    pub async fn policy_check(&self, request: &PolicyCheckRequest) -> PolicyVerdict {
        let Some(source) = self.resolve_tier(&request.sender).await else {
            return PolicyVerdict::deny(format!("unknown sender '{}'", request.sender));
        };
        let Some(target) = self.resolve_tier(&request.receiver).await else {
            return PolicyVerdict::deny(format!("unknown receiver '{}'", request.receiver));
        };
        let addressed = request.receiver.parse::<Tier>().is_err();
        match policy::decide(source, target, request.payload_flags, addressed) {
            Ok(d) => PolicyVerdict {
                allow: true,
                route: Some(d.pattern),
                target: Some(d.target),
                escalated: d.escalated,
                reason: None,
            },
            Err(e) => PolicyVerdict::deny(e.to_string()),
        }
    }

    async fn resolve_tier(&self, party: &str) -> Option<Tier> {
        if let Ok(tier) = party.parse::<Tier>() {
            return Some(tier);
        }
        self.router.member(party).await.map(|m| m.tier)
    }

    /// Legacy text command → single-unit command frame → router.
    /// `tier_override` beats an `@tier` prefix in the command.
    pub async fn send_command(
        &self,
        sender_id: &str,
        line: &str,
        tier_override: Option<Tier>,
    ) -> Result<SendReceipt> {
        let command = LegacyCommand::parse(line)?;
        let tier = tier_override.unwrap_or(command.tier);
        let mut envelope = Envelope::new(sender_id).to(tier).priority(command.priority);
        if let Some(agent) = &command.agent_id {
            envelope = envelope.agent(agent.clone());
        }
        let encoded = self.pipeline.encode_command(&command.text, &envelope)?;
        debug!(sender_id, %tier, text = %command.text, "legacy command translated");
        let frame = encoded.frame.as_bytes().clone();
        self.router
            .send(Outbound {
                source_id: sender_id.to_string(),
                target: tier,
                agent_id: command.agent_id,
                cluster_id: None,
                flags: PayloadFlags::from_header(encoded.frame.header()),
                frame,
            })
            .await
    }

    /// Call a catalog function by name with JSON arguments.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let parse_err = |e: serde_json::Error| RouterError::InvalidArguments {
            function: name.to_string(),
            reason: e.to_string(),
        };
        let value = match name {
            "send" => {
                let req: SendRequest = serde_json::from_value(args).map_err(parse_err)?;
                let receipt = self.send(&req).await?;
                serde_json::to_value(SendAck::from(&receipt))
            }
            "subscribe" => {
                let req: SubscribeRequest = serde_json::from_value(args).map_err(parse_err)?;
                let id = self.subscribe(&req).await?;
                Ok(serde_json::json!({ "subscription_id": id }))
            }
            "health.report" => {
                #[derive(Deserialize)]
                struct Args {
                    agent_id: String,
                }
                let req: Args = serde_json::from_value(args).map_err(parse_err)?;
                serde_json::to_value(self.health_report(&req.agent_id).await?)
            }
            "policy.check" => {
                let req: PolicyCheckRequest = serde_json::from_value(args).map_err(parse_err)?;
                serde_json::to_value(self.policy_check(&req).await)
            }
            other => return Err(RouterError::UnknownFunction(other.to_string())),
        };
        value.map_err(parse_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_defaults_to_prime() {
        let cmd = LegacyCommand::parse("  status report ").unwrap();
        assert_eq!(cmd.tier, Tier::Prime);
        assert_eq!(cmd.priority, DEFAULT_PRIORITY);
        assert_eq!(cmd.agent_id, None);
        assert_eq!(cmd.text, "status report");
    }

    #[test]
    fn test_legacy_prefixes() {
        let cmd = LegacyCommand::parse("@domain !10 >d-12 rebalance north").unwrap();
        assert_eq!(cmd.tier, Tier::Domain);
        assert_eq!(cmd.priority, 10);
        assert_eq!(cmd.agent_id.as_deref(), Some("d-12"));
        assert_eq!(cmd.text, "rebalance north");
    }

    #[test]
    fn test_legacy_rejects_blank() {
        assert!(LegacyCommand::parse("   ").is_err());
    }

    #[test]
    fn test_unknown_prefix_is_text() {
        let cmd = LegacyCommand::parse("@galaxy go").unwrap();
        assert_eq!(cmd.tier, Tier::Prime);
        assert_eq!(cmd.text, "@galaxy go");
    }
}
