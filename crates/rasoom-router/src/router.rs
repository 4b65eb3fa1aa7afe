//! TierRouter: async delivery of frames between Prime, Domain and Micro
//! members.
//!
//! `send` decides the route and resolves recipients against the shared
//! state, then returns a receipt right away; delivery runs on a spawned task
//! that retries with backoff, dead-letters what still fails and reports the
//! final `DeliveryOutcome` through the receipt. Micro→Domain reports go
//! through the aggregator first.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use rasoom_core::time::now_unix_millis;
use rasoom_core::{DecodedMessage, FrameHeader, Tier};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{self, Batch, BatchKey, Command, Pending};
use crate::config::RouterConfig;
use crate::delivery::{
    DeadLetter, DeadLetterReason, Delivery, DeliveryItem, DeliveryOutcome, DeliveryStatus, Mailbox,
};
use crate::error::{Result, RouterError};
use crate::health::{HealthReport, HealthStatus};
use crate::policy::{self, PayloadFlags, RouteDecision, RoutePattern};
use crate::state::{MemberInfo, Provisioning, Recipient, RouterState, RouterStats};
use crate::subscription::{Subscription, Topic};

/// A frame ready for routing, with the addressing pulled out of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    pub source_id: String,
    pub target: Tier,
    pub agent_id: Option<String>,
    pub cluster_id: Option<String>,
    pub flags: PayloadFlags,
    pub frame: Bytes,
}

impl Outbound {
    /// Addressing from the decoded routing metadata.
    pub fn from_decoded(message: &DecodedMessage, frame: Bytes) -> Self {
        let meta = message.metadata();
        Self {
            source_id: message.header.source_id.clone(),
            target: meta.tier,
            agent_id: meta.agent_id.clone(),
            cluster_id: meta.cluster_id.clone(),
            flags: PayloadFlags::from_header(&message.header),
            frame,
        }
    }

    /// Tier-wide addressing from the header alone.
    pub fn from_header(header: &FrameHeader, frame: Bytes) -> Self {
        Self {
            source_id: header.source_id.clone(),
            target: header.target_tier,
            agent_id: None,
            cluster_id: None,
            flags: PayloadFlags::from_header(header),
            frame,
        }
    }
}

#[derive(Debug)]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub decision: RouteDecision,
    /// Recipients resolved when the message was queued.
    pub recipients: usize,
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

impl SendReceipt {
    /// Wait for delivery to finish, successfully or not.
    pub async fn outcome(self) -> Result<DeliveryOutcome> {
        self.outcome.await.map_err(|_| RouterError::Shutdown)
    }
}

/// Transitions reported on the health interface.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RouterEvent {
    Joined { agent_id: String, tier: Tier },
    Left { agent_id: String },
    Queued { message_id: Uuid, route: RoutePattern, recipients: usize },
    Delivered { message_id: Uuid, recipients: usize, latency_us: u64 },
    Retrying { message_id: Uuid, attempt: u32, pending: usize },
    DeadLettered { message_id: Uuid, recipient: String, reason: DeadLetterReason },
    Escalated { message_id: Uuid, source_id: String },
    Cancelled { message_id: Uuid },
    BatchFlushed { batch_id: Uuid, messages: usize },
    HealthChanged { agent_id: String, status: HealthStatus },
}

struct Inflight {
    status: DeliveryStatus,
    token: Option<CancellationToken>,
}

struct Inner {
    config: RouterConfig,
    state: RwLock<RouterState>,
    inflight: Mutex<HashMap<Uuid, Inflight>>,
    events: broadcast::Sender<RouterEvent>,
    aggregator: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Inner {
    fn emit(&self, event: RouterEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn set_status(&self, ids: &[Uuid], status: DeliveryStatus, token: Option<&CancellationToken>) {
        let mut inflight = self.inflight.lock().await;
        for id in ids {
            inflight.insert(
                *id,
                Inflight {
                    status,
                    token: token.cloned(),
                },
            );
        }
    }

    /// Move already tracked ids to `status`, keeping their tokens.
    async fn mark(&self, ids: &[Uuid], status: DeliveryStatus) {
        let mut inflight = self.inflight.lock().await;
        for id in ids {
            if let Some(entry) = inflight.get_mut(id) {
                entry.status = status;
            }
        }
    }

    async fn clear(&self, ids: &[Uuid]) {
        let mut inflight = self.inflight.lock().await;
        for id in ids {
            inflight.remove(id);
        }
    }
}

/// Result of the attempt/retry loop for one delivery.
struct Attempt {
    delivered: Vec<String>,
    failed: Vec<(String, DeadLetterReason)>,
    abandoned: Vec<String>,
    attempts: u32,
    cancelled: bool,
    /// Batch items cancelled between attempts; the rest kept going.
    cancelled_items: Vec<Uuid>,
}

#[derive(Clone)]
pub struct TierRouter {
    inner: Arc<Inner>,
}

impl TierRouter {
    /// Must be called from inside a Tokio runtime: the aggregator actor is
    /// spawned here.
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| RouterError::NoRuntime)?;

        let (agg_tx, agg_rx) = mpsc::channel(config.mailbox_capacity);
        let (events, _) = broadcast::channel(config.event_capacity);
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            state: RwLock::new(RouterState::new(&config)),
            inflight: Mutex::new(HashMap::new()),
            events,
            aggregator: agg_tx,
            shutdown: shutdown.clone(),
            tasks: tasks.clone(),
            config,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let window = inner.config.aggregation;
        tasks.spawn_on(
            aggregator::run(agg_rx, window, shutdown.child_token(), move |batch| {
                if let Some(inner) = weak.upgrade() {
                    let task_inner = Arc::clone(&inner);
                    inner.tasks.spawn(deliver_batch(task_inner, batch));
                }
            }),
            &handle,
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn events(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    pub async fn join(&self, agent_id: &str, tier: Tier, cluster_id: Option<String>) -> Result<Mailbox> {
        let mailbox = self
            .inner
            .state
            .write()
            .await
            .join(agent_id, tier, cluster_id, now_unix_millis())?;
        debug!(agent_id, %tier, "member joined");
        self.inner.emit(RouterEvent::Joined {
            agent_id: agent_id.to_string(),
            tier,
        });
        Ok(mailbox)
    }

    pub async fn leave(&self, agent_id: &str) -> Result<MemberInfo> {
        let info = self.inner.state.write().await.leave(agent_id)?;
        debug!(agent_id, "member left");
        self.inner.emit(RouterEvent::Left {
            agent_id: agent_id.to_string(),
        });
        Ok(info)
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.inner
            .state
            .write()
            .await
            .heartbeat(agent_id, now_unix_millis())
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.inner.state.read().await.members()
    }

    pub async fn member(&self, agent_id: &str) -> Option<MemberInfo> {
        self.inner.state.read().await.member(agent_id).cloned()
    }

    /// Tiers below their configured minimum.
    pub async fn provisioning(&self) -> Vec<Provisioning> {
        self.inner.state.read().await.provisioning()
    }

    pub async fn subscribe(&self, agent_id: &str, topic: &str, source_filter: Option<Tier>) -> Result<Uuid> {
        let topic: Topic = topic.parse()?;
        self.inner
            .state
            .write()
            .await
            .subscribe(agent_id, topic, source_filter, now_unix_millis())
    }

    pub async fn restore_subscription(&self, subscription: Subscription) -> bool {
        self.inner.state.write().await.restore_subscription(subscription)
    }

    pub async fn unsubscribe(&self, id: Uuid) -> Result<Subscription> {
        self.inner.state.write().await.unsubscribe(id)
    }

    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.state.read().await.subscriptions()
    }

    pub async fn health_report(&self, agent_id: &str) -> Result<HealthReport> {
        self.inner.state.read().await.health(agent_id)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state.read().await.dead_letters()
    }

    pub async fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.state.write().await.drain_dead_letters()
    }

    pub async fn stats(&self) -> RouterStats {
        self.inner.state.read().await.stats()
    }

    /// Where an unfinished message currently is. `None` once it has
    /// settled or if the id is unknown.
    pub async fn status(&self, message_id: Uuid) -> Option<DeliveryStatus> {
        self.inner
            .inflight
            .lock()
            .await
            .get(&message_id)
            .map(|f| f.status)
    }

    /// Queue a frame. Policy violations and unroutable addresses fail here,
    /// synchronously; delivery failures are reported through the receipt.
    pub async fn send(&self, outbound: Outbound) -> Result<SendReceipt> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(RouterError::Shutdown);
        }
        let queued_at = Instant::now();
        let message_id = Uuid::new_v4();

        let (decision, recipients, subscribers) = {
            let state = inner.state.read().await;
            let source = state
                .member(&outbound.source_id)
                .ok_or_else(|| RouterError::UnknownAgent(outbound.source_id.clone()))?
                .tier;
            let decision = policy::decide(
                source,
                outbound.target,
                outbound.flags,
                outbound.agent_id.is_some(),
            )?;
            let recipients = state.recipients(
                &outbound.source_id,
                &decision,
                outbound.agent_id.as_deref(),
                outbound.cluster_id.as_deref(),
            )?;
            let names: Vec<String> = recipients.iter().map(|(a, _)| a.clone()).collect();
            let subscribers = state.subscribers(&outbound.source_id, &decision, &names);
            (decision, recipients, subscribers)
        };

        {
            let mut state = inner.state.write().await;
            state.stats.queued += 1;
            if decision.escalated {
                state.stats.escalated += 1;
            }
        }
        inner.set_status(&[message_id], DeliveryStatus::Queued, None).await;
        debug!(%message_id, route = %decision.pattern, recipients = recipients.len(), "queued");
        inner.emit(RouterEvent::Queued {
            message_id,
            route: decision.pattern,
            recipients: recipients.len(),
        });
        if decision.escalated {
            warn!(%message_id, source = %outbound.source_id, "ambiguous urgent message escalated to prime");
            inner.emit(RouterEvent::Escalated {
                message_id,
                source_id: outbound.source_id.clone(),
            });
        }

        let item = DeliveryItem {
            message_id,
            source_id: outbound.source_id.clone(),
            frame: outbound.frame.clone(),
        };
        let delivery = Delivery {
            id: message_id,
            route: decision.pattern,
            source: decision.source,
            target: decision.target,
            escalated: decision.escalated,
            subscribed: false,
            items: vec![item],
        };
        copy_to_subscribers(inner, &delivery, subscribers).await;

        let (notify, outcome) = oneshot::channel();
        let count = recipients.len();
        if decision.pattern == RoutePattern::Aggregate {
            let key = BatchKey {
                agent_id: outbound.agent_id,
                cluster_id: outbound.cluster_id,
            };
            let pending = Pending {
                message_id,
                source_id: outbound.source_id,
                frame: outbound.frame,
                queued_at,
                notify,
            };
            if inner.aggregator.send(Command::Push(key, pending)).await.is_err() {
                inner.clear(&[message_id]).await;
                return Err(RouterError::Shutdown);
            }
        } else {
            inner
                .tasks
                .spawn(deliver_message(Arc::clone(inner), delivery, recipients, queued_at, notify));
        }

        Ok(SendReceipt {
            message_id,
            decision,
            recipients: count,
            outcome,
        })
    }

    /// Abort a message: pending retries stop, or the report leaves its open
    /// aggregation batch. A report inside a flushed batch is dropped from the
    /// next retry while the other reports keep retrying. Returns false when
    /// there is nothing left to cancel.
    pub async fn cancel(&self, message_id: Uuid) -> bool {
        let inner = &self.inner;
        {
            let inflight = inner.inflight.lock().await;
            if let Some(token) = inflight.get(&message_id).and_then(|f| f.token.as_ref()) {
                token.cancel();
                debug!(%message_id, "cancelled pending retries");
                return true;
            }
        }

        let (reply, removed) = oneshot::channel();
        if inner.aggregator.send(Command::Cancel(message_id, reply)).await.is_err() {
            return false;
        }
        let Ok(Some(pending)) = removed.await else {
            return false;
        };
        inner.clear(&[message_id]).await;
        inner.state.write().await.stats.cancelled += 1;
        inner.emit(RouterEvent::Cancelled { message_id });
        let _ = pending.notify.send(DeliveryOutcome {
            message_id,
            status: DeliveryStatus::Cancelled,
            route: RoutePattern::Aggregate,
            escalated: false,
            delivered: Vec::new(),
            failed: Vec::new(),
            attempts: 0,
            latency_us: elapsed_us(pending.queued_at),
            batch_id: None,
        });
        true
    }

    /// Flush every open aggregation batch now.
    pub async fn flush(&self) {
        let (done, flushed) = oneshot::channel();
        if self.inner.aggregator.send(Command::Flush(done)).await.is_ok() {
            let _ = flushed.await;
        }
    }

    /// Flush batches, stop retries and wait for in-flight deliveries.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("router stopped");
    }
}

async fn copy_to_subscribers(inner: &Inner, delivery: &Delivery, subscribers: Vec<Recipient>) {
    if subscribers.is_empty() {
        return;
    }
    let copy = Delivery {
        subscribed: true,
        ..delivery.clone()
    };
    let mut sent = 0;
    for (agent, mailbox) in subscribers {
        match mailbox.try_send(copy.clone()) {
            Ok(()) => sent += 1,
            Err(e) => debug!(agent = %agent, error = %e, "subscriber copy dropped"),
        }
    }
    inner.state.write().await.stats.subscriber_copies += sent;
}

async fn deliver_message(
    inner: Arc<Inner>,
    mut delivery: Delivery,
    recipients: Vec<Recipient>,
    queued_at: Instant,
    notify: oneshot::Sender<DeliveryOutcome>,
) {
    let token = inner.shutdown.child_token();
    let id = delivery.id;
    inner.set_status(&[id], DeliveryStatus::Routing, Some(&token)).await;
    let attempt = attempt_delivery(&inner, &mut delivery, recipients, &token, &HashMap::new()).await;
    inner.clear(&[id]).await;

    let status = settle(&inner, &delivery, &attempt).await;
    let latency_us = elapsed_us(queued_at);
    if status == DeliveryStatus::Delivered {
        inner.emit(RouterEvent::Delivered {
            message_id: id,
            recipients: attempt.delivered.len(),
            latency_us,
        });
    }
    let _ = notify.send(outcome(&delivery, id, status, &attempt, latency_us, None));
}

async fn deliver_batch(inner: Arc<Inner>, batch: Batch) {
    let decision = RouteDecision {
        pattern: RoutePattern::Aggregate,
        source: Tier::Micro,
        target: Tier::Domain,
        escalated: false,
    };
    let ids: Vec<Uuid> = batch.items.iter().map(|p| p.message_id).collect();
    let mut delivery = Delivery {
        id: batch.id,
        route: decision.pattern,
        source: decision.source,
        target: decision.target,
        escalated: false,
        subscribed: false,
        items: batch
            .items
            .iter()
            .map(|p| DeliveryItem {
                message_id: p.message_id,
                source_id: p.source_id.clone(),
                frame: p.frame.clone(),
            })
            .collect(),
    };
    inner.state.write().await.stats.batches += 1;
    debug!(batch_id = %batch.id, messages = ids.len(), "batch flushed");
    inner.emit(RouterEvent::BatchFlushed {
        batch_id: batch.id,
        messages: ids.len(),
    });

    // Domain membership may have changed while the batch was open.
    let recipients = inner.state.read().await.recipients(
        "",
        &decision,
        batch.key.agent_id.as_deref(),
        batch.key.cluster_id.as_deref(),
    );
    let attempt = match recipients {
        Ok(recipients) => {
            let token = inner.shutdown.child_token();
            let items: HashMap<Uuid, CancellationToken> =
                ids.iter().map(|id| (*id, CancellationToken::new())).collect();
            inner.set_status(&[batch.id], DeliveryStatus::Routing, Some(&token)).await;
            for (id, item) in &items {
                inner.set_status(&[*id], DeliveryStatus::Routing, Some(item)).await;
            }
            let attempt = attempt_delivery(&inner, &mut delivery, recipients, &token, &items).await;
            let mut all = ids.clone();
            all.push(batch.id);
            inner.clear(&all).await;
            attempt
        }
        Err(e) => {
            warn!(batch_id = %batch.id, error = %e, "aggregated batch has no recipients");
            inner.clear(&ids).await;
            Attempt {
                delivered: Vec::new(),
                failed: Vec::new(),
                abandoned: Vec::new(),
                attempts: 0,
                cancelled: false,
                cancelled_items: Vec::new(),
            }
        }
    };

    let status = if attempt.attempts == 0 {
        DeliveryStatus::Dropped
    } else {
        settle(&inner, &delivery, &attempt).await
    };
    for pending in batch.items {
        let latency_us = elapsed_us(pending.queued_at);
        let status = if attempt.cancelled_items.contains(&pending.message_id) {
            DeliveryStatus::Cancelled
        } else {
            status
        };
        let _ = pending.notify.send(outcome(
            &delivery,
            pending.message_id,
            status,
            &attempt,
            latency_us,
            Some(batch.id),
        ));
    }
}

/// Try every recipient, retrying timed-out mailboxes with backoff. Closed
/// mailboxes are not retried. Items whose token in `items` was cancelled are
/// removed from `delivery` before the next retry.
async fn attempt_delivery(
    inner: &Inner,
    delivery: &mut Delivery,
    mut pending: Vec<Recipient>,
    token: &CancellationToken,
    items: &HashMap<Uuid, CancellationToken>,
) -> Attempt {
    let budget = inner.config.budgets.for_pattern(delivery.route);
    let mut attempt = Attempt {
        delivered: Vec::with_capacity(pending.len()),
        failed: Vec::new(),
        abandoned: Vec::new(),
        attempts: 0,
        cancelled: false,
        cancelled_items: Vec::new(),
    };

    loop {
        if attempt.attempts > 0 && !items.is_empty() {
            let before = attempt.cancelled_items.len();
            let dropped = &mut attempt.cancelled_items;
            delivery.items.retain(|item| {
                let cancelled = items
                    .get(&item.message_id)
                    .is_some_and(CancellationToken::is_cancelled);
                if cancelled {
                    dropped.push(item.message_id);
                }
                !cancelled
            });
            let left = &attempt.cancelled_items[before..];
            if !left.is_empty() {
                debug!(id = %delivery.id, cancelled = left.len(), "items left the batch");
                inner.clear(left).await;
            }
            if delivery.items.is_empty() {
                attempt.abandoned = pending.into_iter().map(|(agent, _)| agent).collect();
                attempt.cancelled = true;
                break;
            }
        }
        attempt.attempts += 1;
        let results = join_all(pending.into_iter().map(|(agent, mailbox)| {
            let copy = delivery.clone();
            async move {
                let started = Instant::now();
                let result = match timeout(budget, mailbox.send(copy)).await {
                    Ok(Ok(())) => Ok(started.elapsed()),
                    Ok(Err(_)) => Err(DeadLetterReason::MailboxClosed),
                    Err(_) => Err(DeadLetterReason::RoutingTimeout),
                };
                (agent, mailbox, result)
            }
        }))
        .await;

        let mut retry = Vec::new();
        {
            let mut state = inner.state.write().await;
            for (agent, mailbox, result) in results {
                match result {
                    Ok(latency) => {
                        state.record_delivery(&agent, latency);
                        attempt.delivered.push(agent);
                    }
                    Err(reason) => {
                        let closed = reason == DeadLetterReason::MailboxClosed;
                        if let Some(status) = state.record_failure(&agent, closed) {
                            inner.emit(RouterEvent::HealthChanged {
                                agent_id: agent.clone(),
                                status,
                            });
                        }
                        if closed {
                            attempt.failed.push((agent, reason));
                        } else {
                            retry.push((agent, mailbox));
                        }
                    }
                }
            }
            if !retry.is_empty() && attempt.attempts <= inner.config.retry.max_retries {
                state.stats.retried += 1;
            }
        }

        if retry.is_empty() {
            break;
        }
        if attempt.attempts > inner.config.retry.max_retries {
            attempt.failed.extend(
                retry
                    .into_iter()
                    .map(|(agent, _)| (agent, DeadLetterReason::RoutingTimeout)),
            );
            break;
        }

        debug!(id = %delivery.id, attempt = attempt.attempts, pending = retry.len(), "retrying");
        inner.emit(RouterEvent::Retrying {
            message_id: delivery.id,
            attempt: attempt.attempts,
            pending: retry.len(),
        });
        let ids: Vec<Uuid> = std::iter::once(delivery.id)
            .chain(delivery.items.iter().map(|i| i.message_id))
            .collect();
        inner.mark(&ids, DeliveryStatus::Retrying).await;

        let delay: Duration = inner.config.retry.delay(attempt.attempts);
        tokio::select! {
            _ = token.cancelled() => {
                attempt.abandoned = retry.into_iter().map(|(agent, _)| agent).collect();
                attempt.cancelled = true;
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        pending = retry;
    }
    attempt
}

/// Record dead letters and counters for a finished attempt.
async fn settle(inner: &Inner, delivery: &Delivery, attempt: &Attempt) -> DeliveryStatus {
    let status = if attempt.cancelled {
        DeliveryStatus::Cancelled
    } else if attempt.failed.is_empty() {
        DeliveryStatus::Delivered
    } else {
        DeliveryStatus::Dropped
    };

    let now = now_unix_millis();
    let mut state = inner.state.write().await;
    match status {
        DeliveryStatus::Delivered => state.stats.delivered += delivery.items.len() as u64,
        DeliveryStatus::Cancelled => state.stats.cancelled += delivery.items.len() as u64,
        _ => {}
    }
    state.stats.cancelled += attempt.cancelled_items.len() as u64;
    for (recipient, reason) in &attempt.failed {
        for item in &delivery.items {
            warn!(
                message_id = %item.message_id,
                recipient = %recipient,
                reason = reason.as_str(),
                attempts = attempt.attempts,
                "dead-lettered"
            );
            state.push_dead_letter(DeadLetter {
                message_id: item.message_id,
                source_id: item.source_id.clone(),
                recipient: recipient.clone(),
                route: delivery.route,
                target: delivery.target,
                reason: *reason,
                attempts: attempt.attempts,
                dead_at_ms: now,
                frame: item.frame.clone(),
            });
            inner.emit(RouterEvent::DeadLettered {
                message_id: item.message_id,
                recipient: recipient.clone(),
                reason: *reason,
            });
        }
    }
    let cancelled = attempt
        .cancelled_items
        .iter()
        .copied()
        .chain(delivery.items.iter().map(|i| i.message_id).filter(|_| attempt.cancelled));
    for message_id in cancelled {
        inner.emit(RouterEvent::Cancelled { message_id });
    }
    status
}

fn outcome(
    delivery: &Delivery,
    message_id: Uuid,
    status: DeliveryStatus,
    attempt: &Attempt,
    latency_us: u64,
    batch_id: Option<Uuid>,
) -> DeliveryOutcome {
    DeliveryOutcome {
        message_id,
        status,
        route: delivery.route,
        escalated: delivery.escalated,
        delivered: attempt.delivered.clone(),
        failed: attempt
            .failed
            .iter()
            .map(|(a, _)| a.clone())
            .chain(attempt.abandoned.iter().cloned())
            .collect(),
        attempts: attempt.attempts,
        latency_us,
        batch_id,
    }
}

fn elapsed_us(since: Instant) -> u64 {
    since.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(source: &str, target: Tier) -> Outbound {
        Outbound {
            source_id: source.into(),
            target,
            agent_id: None,
            cluster_id: None,
            flags: PayloadFlags::default(),
            frame: Bytes::from_static(b"frame"),
        }
    }

    fn config() -> RouterConfig {
        let mut cfg = RouterConfig::default();
        cfg.limits.prime.min = 0;
        cfg.limits.domain.min = 0;
        cfg
    }

    #[test]
    fn test_new_outside_runtime_is_an_error() {
        let result = std::thread::spawn(|| TierRouter::new(config()).map(|_| ()))
            .join()
            .unwrap();
        assert!(matches!(result, Err(RouterError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_prime_unicast() {
        let router = TierRouter::new(config()).unwrap();
        let _p1 = router.join("p-1", Tier::Prime, None).await.unwrap();
        let mut p2 = router.join("p-2", Tier::Prime, None).await.unwrap();
        let _p3 = router.join("p-3", Tier::Prime, None).await.unwrap();

        let mut msg = outbound("p-1", Tier::Prime);
        msg.agent_id = Some("p-2".into());
        let receipt = router.send(msg).await.unwrap();
        assert_eq!(receipt.decision.pattern, RoutePattern::Unicast);
        assert_eq!(receipt.recipients, 1);
        let outcome = receipt.outcome().await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Delivered);
        assert_eq!(outcome.delivered, vec!["p-2".to_string()]);
        assert_eq!(outcome.attempts, 1);

        let got = p2.recv().await.unwrap();
        assert_eq!(got.items[0].frame, Bytes::from_static(b"frame"));
        assert_eq!(got.source, Tier::Prime);
    }

    #[tokio::test]
    async fn test_unknown_sender_rejected() {
        let router = TierRouter::new(config()).unwrap();
        assert!(matches!(
            router.send(outbound("nobody", Tier::Prime)).await,
            Err(RouterError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_policy_violation_is_synchronous() {
        let router = TierRouter::new(config()).unwrap();
        let _m = router.join("m-1", Tier::Micro, None).await.unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        assert!(matches!(
            router.send(outbound("m-1", Tier::Prime)).await,
            Err(RouterError::PolicyViolation(_))
        ));
        assert_eq!(router.stats().await.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_mailbox_retries_then_dead_letters() {
        let mut cfg = config();
        cfg.mailbox_capacity = 1;
        let router = TierRouter::new(cfg).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        let _d = router.join("d-1", Tier::Domain, None).await.unwrap();

        let first = router.send(outbound("p-1", Tier::Domain)).await.unwrap();
        assert_eq!(first.outcome().await.unwrap().status, DeliveryStatus::Delivered);

        let second = router.send(outbound("p-1", Tier::Domain)).await.unwrap();
        let outcome = second.outcome().await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Dropped);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.failed, vec!["d-1".to_string()]);

        let dead = router.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::RoutingTimeout);
        assert_eq!(dead[0].recipient, "d-1");
        let stats = router.stats().await;
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(
            router.health_report("d-1").await.unwrap().status,
            HealthStatus::Unreachable
        );
    }

    #[tokio::test]
    async fn test_closed_mailbox_is_not_retried() {
        let router = TierRouter::new(config()).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        drop(router.join("p-2", Tier::Prime, None).await.unwrap());
        let outcome = router
            .send(outbound("p-1", Tier::Prime))
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Dropped);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(router.dead_letters().await[0].reason, DeadLetterReason::MailboxClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retries() {
        let mut cfg = config();
        cfg.mailbox_capacity = 1;
        cfg.retry.initial_delay_ms = 1_000;
        cfg.retry.max_delay_ms = 1_000;
        let router = TierRouter::new(cfg).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        let _d = router.join("d-1", Tier::Domain, None).await.unwrap();
        router
            .send(outbound("p-1", Tier::Domain))
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();

        let receipt = router.send(outbound("p-1", Tier::Domain)).await.unwrap();
        let id = receipt.message_id;
        let mut waited = 0;
        while router.status(id).await != Some(DeliveryStatus::Retrying) {
            tokio::time::sleep(Duration::from_millis(1)).await;
            waited += 1;
            assert!(waited < 100, "never reached retrying");
        }
        assert!(router.cancel(id).await);
        let outcome = receipt.outcome().await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Cancelled);
        assert!(router.dead_letters().await.is_empty());
        assert!(!router.cancel(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_one_report_in_retrying_batch() {
        let mut cfg = config();
        cfg.mailbox_capacity = 1;
        cfg.aggregation.max_wait_ms = 60_000;
        cfg.retry.initial_delay_ms = 1_000;
        cfg.retry.max_delay_ms = 1_000;
        let router = TierRouter::new(cfg).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        let mut d = router.join("d-1", Tier::Domain, None).await.unwrap();
        let _m1 = router.join("m-1", Tier::Micro, None).await.unwrap();
        let _m2 = router.join("m-2", Tier::Micro, None).await.unwrap();
        router
            .send(outbound("p-1", Tier::Domain))
            .await
            .unwrap()
            .outcome()
            .await
            .unwrap();

        let first = router.send(outbound("m-1", Tier::Domain)).await.unwrap();
        let second = router.send(outbound("m-2", Tier::Domain)).await.unwrap();
        let (first_id, second_id) = (first.message_id, second.message_id);
        router.flush().await;
        let mut waited = 0;
        while router.status(first_id).await != Some(DeliveryStatus::Retrying) {
            tokio::time::sleep(Duration::from_millis(1)).await;
            waited += 1;
            assert!(waited < 100, "never reached retrying");
        }
        assert!(router.cancel(first_id).await);

        // room for the batch on its next attempt
        assert_eq!(d.recv().await.unwrap().route, RoutePattern::ClusterMulticast);
        let cancelled = first.outcome().await.unwrap();
        let delivered = second.outcome().await.unwrap();
        assert_eq!(cancelled.status, DeliveryStatus::Cancelled);
        assert_eq!(delivered.status, DeliveryStatus::Delivered);

        let batch = d.recv().await.unwrap();
        assert_eq!(batch.items.len(), 1);
        assert_eq!(batch.items[0].message_id, second_id);
        assert!(router.dead_letters().await.is_empty());
        let stats = router.stats().await;
        assert_eq!(stats.cancelled, 1);
        assert!(!router.cancel(first_id).await);
    }

    #[tokio::test]
    async fn test_micro_reports_are_batched() {
        let mut cfg = config();
        cfg.aggregation.max_wait_ms = 60_000;
        let router = TierRouter::new(cfg).unwrap();
        let mut d = router.join("d-1", Tier::Domain, None).await.unwrap();
        for i in 0..3 {
            router.join(&format!("m-{i}"), Tier::Micro, None).await.unwrap();
        }
        let mut receipts = Vec::new();
        for i in 0..3 {
            receipts.push(router.send(outbound(&format!("m-{i}"), Tier::Domain)).await.unwrap());
        }
        router.flush().await;
        let mut batch_ids = Vec::new();
        for r in receipts {
            let outcome = r.outcome().await.unwrap();
            assert_eq!(outcome.status, DeliveryStatus::Delivered);
            assert_eq!(outcome.route, RoutePattern::Aggregate);
            batch_ids.push(outcome.batch_id.unwrap());
        }
        assert!(batch_ids.windows(2).all(|w| w[0] == w[1]));
        let delivery = d.recv().await.unwrap();
        assert_eq!(delivery.items.len(), 3);
        assert_eq!(delivery.id, batch_ids[0]);
    }

    #[tokio::test]
    async fn test_cancel_open_report() {
        let mut cfg = config();
        cfg.aggregation.max_wait_ms = 60_000;
        let router = TierRouter::new(cfg).unwrap();
        let _d = router.join("d-1", Tier::Domain, None).await.unwrap();
        let _m = router.join("m-1", Tier::Micro, None).await.unwrap();
        let receipt = router.send(outbound("m-1", Tier::Domain)).await.unwrap();
        assert_eq!(router.status(receipt.message_id).await, Some(DeliveryStatus::Queued));
        assert!(router.cancel(receipt.message_id).await);
        let outcome = receipt.outcome().await.unwrap();
        assert_eq!(outcome.status, DeliveryStatus::Cancelled);
        assert_eq!(router.stats().await.cancelled, 1);
    }

    #[tokio::test]
    async fn test_subscribers_get_copies() {
        let router = TierRouter::new(config()).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        let _d = router.join("d-1", Tier::Domain, Some("north".into())).await.unwrap();
        let mut watcher = router.join("d-9", Tier::Domain, Some("south".into())).await.unwrap();
        router.subscribe("d-9", "domain.multicast", Some(Tier::Prime)).await.unwrap();

        let mut msg = outbound("p-1", Tier::Domain);
        msg.cluster_id = Some("north".into());
        let outcome = router.send(msg).await.unwrap().outcome().await.unwrap();
        assert_eq!(outcome.delivered, vec!["d-1".to_string()]);

        let copy = watcher.try_recv().unwrap();
        assert!(copy.subscribed);
        assert_eq!(copy.route, RoutePattern::ClusterMulticast);
        assert_eq!(router.stats().await.subscriber_copies, 1);
    }

    #[tokio::test]
    async fn test_escalation_goes_to_prime() {
        let router = TierRouter::new(config()).unwrap();
        let mut p = router.join("p-1", Tier::Prime, None).await.unwrap();
        let _d = router.join("d-1", Tier::Domain, None).await.unwrap();
        let _m = router.join("m-1", Tier::Micro, None).await.unwrap();
        let mut events = router.events();

        let mut msg = outbound("d-1", Tier::Micro);
        msg.flags = PayloadFlags {
            priority: 9,
            escalate: true,
            bypass: false,
        };
        let outcome = router.send(msg).await.unwrap().outcome().await.unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.route, RoutePattern::Escalation);
        assert!(p.recv().await.unwrap().escalated);

        let mut saw_escalation = false;
        while let Ok(ev) = events.try_recv() {
            saw_escalation |= matches!(ev, RouterEvent::Escalated { .. });
        }
        assert!(saw_escalation);
        assert_eq!(router.stats().await.escalated, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_seen() {
        let router = TierRouter::new(config()).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        let joined = router.member("p-1").await.unwrap().last_seen_ms;
        tokio::time::sleep(Duration::from_millis(5)).await;
        router.heartbeat("p-1").await.unwrap();
        assert!(router.member("p-1").await.unwrap().last_seen_ms >= joined);
        assert!(matches!(
            router.heartbeat("ghost").await,
            Err(RouterError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_sends() {
        let router = TierRouter::new(config()).unwrap();
        let _p = router.join("p-1", Tier::Prime, None).await.unwrap();
        router.shutdown().await;
        assert!(matches!(
            router.send(outbound("p-1", Tier::Prime)).await,
            Err(RouterError::Shutdown)
        ));
    }
}
