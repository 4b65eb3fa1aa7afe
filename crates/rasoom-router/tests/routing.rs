//! Router and adapter tests driven by real pipeline frames.

use rasoom_core::{Envelope, MultimodalEvent, Pipeline, PipelineConfig, Tier};
use rasoom_router::{
    DeliveryStatus, ExternalRegistry, FunctionSpec, Outbound, PayloadFlags, PolicyCheckRequest,
    ProtocolAdapter, RoutePattern, RouterConfig, RouterError, SendRequest, TierRouter,
};
use serde_json::json;

fn config() -> RouterConfig {
    let mut cfg = RouterConfig::default();
    cfg.limits.prime.min = 0;
    cfg.limits.domain.min = 0;
    cfg
}

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig::default()).unwrap()
}

fn confirm_event() -> MultimodalEvent {
    MultimodalEvent::single(1_700_000_000_000, [0.2, 0.2], 0.1, 0.05, 0.1)
}

/// Prime → Domain multicast into a 150-member cluster stays inside the
/// cluster budget in at least 95% of trials.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_multicast_latency() {
    let router = TierRouter::new(config()).unwrap();
    let _prime = router.join("p-1", Tier::Prime, None).await.unwrap();
    let mut drains = Vec::new();
    for i in 0..150 {
        let mut mailbox = router
            .join(&format!("d-{i:03}"), Tier::Domain, Some("c1".into()))
            .await
            .unwrap();
        drains.push(tokio::spawn(async move { while mailbox.recv().await.is_some() {} }));
    }
    let _other = router.join("d-x", Tier::Domain, Some("c2".into())).await.unwrap();

    let p = pipeline();
    let env = Envelope::new("p-1").to(Tier::Domain).cluster("c1");
    let frame = p.encode_event(&confirm_event(), &env).unwrap();
    let decoded = p.decode(frame.frame.as_bytes()).unwrap();

    let trials = 100;
    let mut latencies = Vec::with_capacity(trials);
    for _ in 0..trials {
        let receipt = router
            .send(Outbound::from_decoded(&decoded, frame.frame.as_bytes().clone()))
            .await
            .unwrap();
        assert_eq!(receipt.decision.pattern, RoutePattern::ClusterMulticast);
        assert_eq!(receipt.recipients, 150);
        let outcome = receipt.outcome().await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Delivered);
        assert_eq!(outcome.delivered.len(), 150);
        latencies.push(outcome.latency_us);
    }
    latencies.sort_unstable();
    let p95 = latencies[trials * 95 / 100 - 1];
    assert!(p95 < 5_000, "p95 {p95}us");

    router.shutdown().await;
    for agent in router.members().await {
        router.leave(&agent.agent_id).await.unwrap();
    }
    for d in drains {
        d.await.unwrap();
    }
}

/// The reference `confirm` gesture reaches exactly one Prime peer.
#[tokio::test]
async fn test_reference_scenario_prime_unicast() {
    let router = TierRouter::new(config()).unwrap();
    let _p1 = router.join("prime-01", Tier::Prime, None).await.unwrap();
    let mut p2 = router.join("prime-02", Tier::Prime, None).await.unwrap();
    let mut p3 = router.join("prime-03", Tier::Prime, None).await.unwrap();

    let p = pipeline();
    let msg = p
        .encode_event(&confirm_event(), &Envelope::new("prime-01").agent("prime-02"))
        .unwrap();
    let decoded = p.decode(msg.frame.as_bytes()).unwrap();
    assert_eq!(decoded.header.target_tier, Tier::Prime);

    let receipt = router
        .send(Outbound::from_decoded(&decoded, msg.frame.as_bytes().clone()))
        .await
        .unwrap();
    assert_eq!(receipt.decision.pattern, RoutePattern::Unicast);
    let outcome = receipt.outcome().await.unwrap().into_result().unwrap();
    assert_eq!(outcome.delivered, vec!["prime-02".to_string()]);

    let got = p2.recv().await.unwrap();
    let back = p.decode(&got.items[0].frame).unwrap();
    assert_eq!(back.units[0].notation(), "ga:1:1@prime");
    assert!(p3.try_recv().is_none());
}

/// The adapter refuses frames whose claimed sender disagrees with the header.
#[tokio::test]
async fn test_adapter_checks_claims() {
    let router = TierRouter::new(config()).unwrap();
    let _p1 = router.join("prime-01", Tier::Prime, None).await.unwrap();
    let mut p2 = router.join("prime-02", Tier::Prime, None).await.unwrap();
    let adapter = ProtocolAdapter::new(pipeline(), router, &ExternalRegistry::default());

    let msg = adapter
        .pipeline()
        .encode_event(&confirm_event(), &Envelope::new("prime-01").agent("prime-02"))
        .unwrap();
    let mut request = SendRequest {
        sender_id: "prime-01".into(),
        tier_target: Tier::Prime,
        frame: msg.frame.to_hex(),
        priority: 5,
    };

    request.sender_id = "prime-02".into();
    assert!(matches!(
        adapter.send(&request).await,
        Err(RouterError::PolicyViolation(_))
    ));
    request.sender_id = "prime-01".into();
    request.tier_target = Tier::Domain;
    assert!(matches!(
        adapter.send(&request).await,
        Err(RouterError::PolicyViolation(_))
    ));
    request.tier_target = Tier::Prime;

    let receipt = adapter.send(&request).await.unwrap();
    receipt.outcome().await.unwrap().into_result().unwrap();
    assert_eq!(p2.recv().await.unwrap().items.len(), 1);
}

#[tokio::test]
async fn test_adapter_call_dispatch() {
    let router = TierRouter::new(config()).unwrap();
    let _m = router.join("m-1", Tier::Micro, None).await.unwrap();
    let _d = router.join("d-1", Tier::Domain, Some("c1".into())).await.unwrap();
    let registry = ExternalRegistry {
        functions: vec![
            FunctionSpec {
                name: "send".into(),
                description: "shadow".into(),
                params: Vec::new(),
                builtin: false,
            },
            FunctionSpec {
                name: "swarm.census".into(),
                description: "count micro agents".into(),
                params: Vec::new(),
                builtin: false,
            },
        ],
    };
    let adapter = ProtocolAdapter::new(pipeline(), router, &registry);
    assert_eq!(adapter.merge_report().conflicts, vec!["send".to_string()]);
    assert!(adapter.catalog().get("swarm.census").is_some());

    let verdict = adapter
        .call("policy.check", json!({ "sender": "m-1", "receiver": "prime" }))
        .await
        .unwrap();
    assert_eq!(verdict["allow"], json!(false));

    let verdict = adapter
        .policy_check(&PolicyCheckRequest {
            sender: "m-1".into(),
            receiver: "domain".into(),
            payload_flags: PayloadFlags::default(),
        })
        .await;
    assert!(verdict.allow);
    assert_eq!(verdict.route, Some(RoutePattern::Aggregate));

    let report = adapter
        .call("health.report", json!({ "agent_id": "d-1" }))
        .await
        .unwrap();
    assert_eq!(report["status"], json!("healthy"));

    assert!(matches!(
        adapter.call("swarm.census", json!({})).await,
        Err(RouterError::UnknownFunction(_))
    ));
    assert!(matches!(
        adapter.call("subscribe", json!({ "topic": 3 })).await,
        Err(RouterError::InvalidArguments { .. })
    ));
}

/// A legacy command from a Domain agent lands in its Micro swarm.
#[tokio::test]
async fn test_legacy_command_to_swarm() {
    let router = TierRouter::new(config()).unwrap();
    let _d = router.join("d-1", Tier::Domain, Some("c1".into())).await.unwrap();
    let mut m1 = router.join("m-1", Tier::Micro, Some("c1".into())).await.unwrap();
    let adapter = ProtocolAdapter::new(pipeline(), router, &ExternalRegistry::default());

    let receipt = adapter
        .send_command("d-1", "@micro !6 scatter east", None)
        .await
        .unwrap();
    assert_eq!(receipt.decision.pattern, RoutePattern::SwarmMulticast);
    receipt.outcome().await.unwrap().into_result().unwrap();

    let got = m1.recv().await.unwrap();
    let back = adapter.pipeline().decode(&got.items[0].frame).unwrap();
    assert_eq!(back.header.priority, 6);
    assert_eq!(back.text.as_deref(), Some("scatter east"));
}
