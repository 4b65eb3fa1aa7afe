//! Prime → Domain cluster multicast latency trials.

use anyhow::{Context, Result, bail};
use rasoom_core::{Envelope, Pipeline, Tier, synth};
use rasoom_router::{DeliveryStatus, Outbound, RouterConfig, TierRouter};
use serde::Serialize;

const CLUSTER: &str = "bench";
const SENDER: &str = "bench-prime";

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub members: usize,
    pub trials: usize,
    pub budget_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
    /// Fraction of trials delivered to every member inside the budget.
    pub within_budget: f64,
}

pub async fn cluster_multicast(
    mut config: RouterConfig,
    pipeline: &Pipeline,
    members: usize,
    trials: usize,
    seed: u64,
) -> Result<BenchReport> {
    if trials == 0 {
        bail!("need at least one trial");
    }
    config.limits.domain.max = config.limits.domain.max.max(members);
    let budget_us = config.budgets.cluster_ms * 1_000;
    let router = TierRouter::new(config).context("failed to start router")?;

    router.join(SENDER, Tier::Prime, None).await?;
    let mut drains = Vec::with_capacity(members);
    for i in 0..members {
        let mut mailbox = router
            .join(&format!("bench-d{i:03}"), Tier::Domain, Some(CLUSTER.into()))
            .await?;
        drains.push(tokio::spawn(async move { while mailbox.recv().await.is_some() {} }));
    }

    let env = Envelope::new(SENDER).to(Tier::Domain).cluster(CLUSTER);
    let mut latencies = Vec::with_capacity(trials);
    let mut within = 0usize;
    for raw in synth::corpus(seed, trials) {
        let msg = pipeline.encode(&raw, &env).context("failed to encode trial input")?;
        let mut outbound = Outbound::from_header(msg.frame.header(), msg.frame.as_bytes().clone());
        outbound.cluster_id = Some(CLUSTER.into());
        let outcome = router.send(outbound).await?.outcome().await?;
        if outcome.status == DeliveryStatus::Delivered && outcome.latency_us <= budget_us {
            within += 1;
        }
        latencies.push(outcome.latency_us);
    }

    router.shutdown().await;
    for m in router.members().await {
        router.leave(&m.agent_id).await?;
    }
    for d in drains {
        let _ = d.await;
    }

    latencies.sort_unstable();
    Ok(BenchReport {
        members,
        trials,
        budget_us,
        p50_us: percentile(&latencies, 0.50),
        p95_us: percentile(&latencies, 0.95),
        p99_us: percentile(&latencies, 0.99),
        max_us: latencies.last().copied().unwrap_or(0),
        within_budget: within as f64 / trials as f64,
    })
}

/// Nearest-rank percentile of sorted samples.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() as f64 * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
