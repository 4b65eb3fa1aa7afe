use std::collections::HashMap;
use std::sync::Arc;

use rasoom_core::Tier;
use rasoom_core::time::now_unix_millis;
use rasoom_router::{
    Delivery, Mailbox, PayloadFlags, PolicyCheckRequest, ProtocolAdapter, RouterError, SendAck,
    SendRequest, SubscribeRequest,
};
use rasoom_store::Store;
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_RECEIVE_MAX: usize = 32;

#[derive(Clone)]
pub struct RasoomServer {
    adapter: ProtocolAdapter,
    state: Arc<Mutex<ServerState>>,
    tool_router: ToolRouter<Self>,
}

struct ServerState {
    store: Store,
    /// Mailboxes of the members this process joined on their behalf.
    mailboxes: HashMap<String, Mailbox>,
}

impl RasoomServer {
    pub fn new(adapter: ProtocolAdapter, store: Store, mailboxes: HashMap<String, Mailbox>) -> Self {
        Self {
            adapter,
            state: Arc::new(Mutex::new(ServerState { store, mailboxes })),
            tool_router: Self::tool_router(),
        }
    }

    /// Drain the router into the store. Failures are logged, never returned.
    async fn persist_dead_letters(&self) {
        let letters = self.adapter.router().drain_dead_letters().await;
        if letters.is_empty() {
            return;
        }
        let state = self.state.lock().await;
        if let Err(e) = state.store.insert_dead_letters(&letters) {
            tracing::error!("failed to persist {} dead letters: {e}", letters.len());
        }
    }

    /// Stop the router, keep its dead letters and checkpoint the WAL.
    pub async fn shutdown(&self) {
        self.adapter.router().shutdown().await;
        self.persist_dead_letters().await;
        let state = self.state.lock().await;
        if let Err(e) = state.store.mark_shutdown(now_unix_millis()) {
            tracing::warn!("failed to record shutdown: {e}");
        }
        if let Err(e) = state.store.checkpoint() {
            tracing::warn!("WAL checkpoint failed: {e}");
        }
        tracing::info!("WAL checkpoint complete");
    }
}

fn router_err(e: RouterError) -> McpError {
    let caller_fault = matches!(
        e,
        RouterError::PolicyViolation(_)
            | RouterError::UnknownAgent(_)
            | RouterError::NoRecipients { .. }
            | RouterError::InvalidTopic(_)
            | RouterError::UnknownSubscription(_)
            | RouterError::InvalidFrame(_)
            | RouterError::UnknownFunction(_)
            | RouterError::InvalidArguments { .. }
            | RouterError::Pipeline(_)
    );
    if caller_fault {
        McpError::invalid_params(e.to_string(), None)
    } else {
        McpError::internal_error(e.to_string(), None)
    }
}

fn parse_tier(s: &str) -> Result<Tier, McpError> {
    s.parse()
        .map_err(|e: String| McpError::invalid_params(e, None))
}

fn json_result(value: &serde_json::Value) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(
        serde_json::to_string_pretty(value).unwrap_or_default(),
    )]))
}

fn delivery_json(d: &Delivery) -> serde_json::Value {
    json!({
        "id": d.id,
        "route": d.route,
        "source": d.source,
        "target": d.target,
        "escalated": d.escalated,
        "subscribed": d.subscribed,
        "items": d.items.iter().map(|i| json!({
            "message_id": i.message_id,
            "source_id": i.source_id,
            "frame": hex::encode(&i.frame),
        })).collect::<Vec<_>>(),
    })
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct SendParams {
    /// Agent id of the sender; must match the frame header
    sender_id: String,
    /// Target tier: prime, domain or micro
    tier_target: String,
    /// Hex-encoded frame
    frame: String,
    /// 1..=10; must match the frame header
    priority: u8,
    /// Wait for delivery to finish and include the outcome
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SubscribeParams {
    agent_id: String,
    /// `<tier>.<pattern>`, `<tier>.*`, `<tier>.<prefix>*` or `*`
    topic: String,
    /// Only copy messages sent from this tier
    tier_filter: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct UnsubscribeParams {
    subscription_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AgentParams {
    agent_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PolicyParams {
    /// Agent id or tier name
    sender: String,
    /// Agent id or tier name
    receiver: String,
    priority: Option<u8>,
    #[serde(default)]
    escalate: bool,
    #[serde(default)]
    bypass: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CallParams {
    /// Catalog function name, e.g. `health.report`
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReceiveParams {
    agent_id: String,
    /// Deliveries to take at most (default 32)
    max: Option<usize>,
}

#[tool_router]
impl RasoomServer {
    #[tool(
        description = "Route a binary frame. The sender, tier and priority are checked against the frame header before routing. Returns the route, resolved target tier and recipient count; with wait=true also the delivery outcome."
    )]
    async fn send(&self, Parameters(req): Parameters<SendParams>) -> Result<CallToolResult, McpError> {
        let request = SendRequest {
            sender_id: req.sender_id,
            tier_target: parse_tier(&req.tier_target)?,
            frame: req.frame,
            priority: req.priority,
        };
        let receipt = self.adapter.send(&request).await.map_err(router_err)?;
        let ack = SendAck::from(&receipt);
        let outcome = if req.wait {
            Some(receipt.outcome().await.map_err(router_err)?)
        } else {
            None
        };
        self.persist_dead_letters().await;
        json_result(&json!({ "ack": ack, "outcome": outcome }))
    }

    #[tool(description = "Subscribe an agent to copies of matching deliveries, e.g. topic 'domain.multicast'.")]
    async fn subscribe(
        &self,
        Parameters(req): Parameters<SubscribeParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = SubscribeRequest {
            agent_id: req.agent_id,
            topic: req.topic,
            tier_filter: req.tier_filter.as_deref().map(parse_tier).transpose()?,
        };
        let id = self.adapter.subscribe(&request).await.map_err(router_err)?;
        let subs = self.adapter.router().subscriptions().await;
        if let Some(sub) = subs.iter().find(|s| s.id == id) {
            let state = self.state.lock().await;
            state
                .store
                .save_subscription(sub)
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        }
        json_result(&json!({ "subscription_id": id }))
    }

    #[tool(description = "Remove a subscription by id.")]
    async fn unsubscribe(
        &self,
        Parameters(req): Parameters<UnsubscribeParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = Uuid::parse_str(&req.subscription_id)
            .map_err(|e| McpError::invalid_params(format!("invalid subscription id: {e}"), None))?;
        let sub = self.adapter.router().unsubscribe(id).await.map_err(router_err)?;
        let state = self.state.lock().await;
        state
            .store
            .delete_subscription(id)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        json_result(&json!({ "removed": sub.id, "topic": sub.topic }))
    }

    #[tool(
        name = "health_report",
        description = "Delivery health of one agent: status, latency_ms, error_rate, subscription_count."
    )]
    async fn health_report(
        &self,
        Parameters(req): Parameters<AgentParams>,
    ) -> Result<CallToolResult, McpError> {
        let report = self
            .adapter
            .health_report(&req.agent_id)
            .await
            .map_err(router_err)?;
        json_result(&json!(report))
    }

    #[tool(
        name = "policy_check",
        description = "Would a message from sender to receiver be allowed? Parties are agent ids or tier names. Never fails; a denial carries the reason."
    )]
    async fn policy_check(
        &self,
        Parameters(req): Parameters<PolicyParams>,
    ) -> Result<CallToolResult, McpError> {
        let mut payload_flags = PayloadFlags::default();
        if let Some(priority) = req.priority {
            payload_flags.priority = priority;
        }
        payload_flags.escalate = req.escalate;
        payload_flags.bypass = req.bypass;
        let verdict = self
            .adapter
            .policy_check(&PolicyCheckRequest {
                sender: req.sender,
                receiver: req.receiver,
                payload_flags,
            })
            .await;
        json_result(&json!(verdict))
    }

    #[tool(description = "List the function catalog: built-ins plus external registry entries.")]
    async fn catalog(&self) -> Result<CallToolResult, McpError> {
        json_result(&json!({
            "functions": self.adapter.catalog().functions().collect::<Vec<_>>(),
            "merge": self.adapter.merge_report(),
        }))
    }

    #[tool(description = "Call any catalog function by name with JSON arguments, e.g. name='health.report', arguments={agent_id}.")]
    async fn call(&self, Parameters(req): Parameters<CallParams>) -> Result<CallToolResult, McpError> {
        let value = self
            .adapter
            .call(&req.name, req.arguments)
            .await
            .map_err(router_err)?;
        self.persist_dead_letters().await;
        json_result(&value)
    }

    #[tool(description = "Take pending deliveries from the mailbox of an agent hosted by this server. Frames are hex-encoded.")]
    async fn receive(
        &self,
        Parameters(req): Parameters<ReceiveParams>,
    ) -> Result<CallToolResult, McpError> {
        let max = req.max.unwrap_or(DEFAULT_RECEIVE_MAX);
        let mut state = self.state.lock().await;
        let mailbox = state.mailboxes.get_mut(&req.agent_id).ok_or_else(|| {
            McpError::invalid_params(format!("agent '{}' is not hosted here", req.agent_id), None)
        })?;
        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some(d) = mailbox.try_recv() else { break };
            deliveries.push(delivery_json(&d));
        }
        drop(state);
        // draining a mailbox counts as liveness
        self.adapter
            .router()
            .heartbeat(&req.agent_id)
            .await
            .map_err(router_err)?;
        json_result(&json!({ "agent_id": req.agent_id, "deliveries": deliveries }))
    }
}

#[tool_handler]
impl ServerHandler for RasoomServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Rasoom tier router. Agents are organised in three tiers: prime (strategic), \
                 domain (specialised clusters) and micro (swarm).\n\n\
                 - send routes a hex frame produced by `rasoom encode`; the header must agree \
                   with sender_id, tier_target and priority.\n\
                 - policy_check answers whether a route is allowed without sending anything.\n\
                 - subscribe/unsubscribe manage topic copies; receive drains a hosted agent's mailbox.\n\
                 - health_report gives per-agent delivery health.\n\
                 - catalog lists every function; call dispatches one by its catalog name."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rasoom_core::{Envelope, MultimodalEvent, Pipeline, PipelineConfig};
    use rasoom_router::{ExternalRegistry, RouterConfig, TierRouter};

    async fn make_server() -> RasoomServer {
        let mut cfg = RouterConfig::default();
        cfg.limits.prime.min = 0;
        cfg.limits.domain.min = 0;
        let router = TierRouter::new(cfg).unwrap();
        let mut mailboxes = HashMap::new();
        for id in ["p-1", "p-2"] {
            mailboxes.insert(id.to_string(), router.join(id, Tier::Prime, None).await.unwrap());
        }
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let adapter = ProtocolAdapter::new(pipeline, router, &ExternalRegistry::default());
        RasoomServer::new(adapter, Store::open_in_memory().unwrap(), mailboxes)
    }

    fn text_from_result(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn parse_result(result: &CallToolResult) -> serde_json::Value {
        let text = text_from_result(result);
        serde_json::from_str(&text).expect("handler should return valid JSON")
    }

    fn confirm_frame(pipeline: &Pipeline) -> String {
        let event = MultimodalEvent::single(1_700_000_000_000, [0.2, 0.2], 0.1, 0.05, 0.1);
        pipeline
            .encode_event(&event, &Envelope::new("p-1").agent("p-2"))
            .unwrap()
            .frame
            .to_hex()
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let server = make_server().await;
        let frame = confirm_frame(server.adapter.pipeline());

        let result = server
            .send(Parameters(SendParams {
                sender_id: "p-1".into(),
                tier_target: "prime".into(),
                frame: frame.clone(),
                priority: 5,
                wait: true,
            }))
            .await
            .unwrap();
        let json = parse_result(&result);
        assert_eq!(json["ack"]["route"], "unicast");
        assert_eq!(json["outcome"]["status"], "delivered");

        let got = parse_result(
            &server
                .receive(Parameters(ReceiveParams {
                    agent_id: "p-2".into(),
                    max: None,
                }))
                .await
                .unwrap(),
        );
        assert_eq!(got["deliveries"][0]["items"][0]["frame"], frame);
    }

    #[tokio::test]
    async fn test_send_with_wrong_sender_rejected() {
        let server = make_server().await;
        let frame = confirm_frame(server.adapter.pipeline());
        let err = server
            .send(Parameters(SendParams {
                sender_id: "p-2".into(),
                tier_target: "prime".into(),
                frame,
                priority: 5,
                wait: false,
            }))
            .await
            .unwrap_err();
        assert!(err.message.contains("does not match"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_policy_check_denies_micro_to_prime() {
        let server = make_server().await;
        let json = parse_result(
            &server
                .policy_check(Parameters(PolicyParams {
                    sender: "micro".into(),
                    receiver: "p-1".into(),
                    priority: None,
                    escalate: false,
                    bypass: false,
                }))
                .await
                .unwrap(),
        );
        assert_eq!(json["allow"], false);
        assert!(json["reason"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_subscription_is_persisted() {
        let server = make_server().await;
        let json = parse_result(
            &server
                .subscribe(Parameters(SubscribeParams {
                    agent_id: "p-1".into(),
                    topic: "prime.*".into(),
                    tier_filter: None,
                }))
                .await
                .unwrap(),
        );
        let id = json["subscription_id"].as_str().unwrap().to_string();
        {
            let state = server.state.lock().await;
            assert_eq!(state.store.subscriptions().unwrap().len(), 1);
        }
        server
            .unsubscribe(Parameters(UnsubscribeParams { subscription_id: id }))
            .await
            .unwrap();
        let state = server.state.lock().await;
        assert!(state.store.subscriptions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_catalog_and_call() {
        let server = make_server().await;
        let catalog = parse_result(&server.catalog().await.unwrap());
        assert_eq!(catalog["functions"].as_array().unwrap().len(), 4);

        let report = parse_result(
            &server
                .call(Parameters(CallParams {
                    name: "health.report".into(),
                    arguments: json!({ "agent_id": "p-2" }),
                }))
                .await
                .unwrap(),
        );
        assert_eq!(report["agent_id"], "p-2");

        let err = server
            .call(Parameters(CallParams {
                name: "nope".into(),
                arguments: json!({}),
            }))
            .await
            .unwrap_err();
        assert!(err.message.contains("nope"), "{}", err.message);
    }

    #[tokio::test]
    async fn test_receive_unknown_agent() {
        let server = make_server().await;
        assert!(
            server
                .receive(Parameters(ReceiveParams {
                    agent_id: "ghost".into(),
                    max: Some(1),
                }))
                .await
                .is_err()
        );
    }
}
