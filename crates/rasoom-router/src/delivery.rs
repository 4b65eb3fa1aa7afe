use bytes::Bytes;
use rasoom_core::Tier;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RouterError;
use crate::policy::RoutePattern;

/// One frame inside a delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryItem {
    pub message_id: Uuid,
    pub source_id: String,
    pub frame: Bytes,
}

/// What lands in a member's mailbox. Aggregated Micro reports arrive as one
/// delivery holding the whole batch; everything else carries a single item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Message id, or the batch id for aggregates.
    pub id: Uuid,
    pub route: RoutePattern,
    pub source: Tier,
    pub target: Tier,
    pub escalated: bool,
    /// True for best-effort copies sent to topic subscribers.
    pub subscribed: bool,
    pub items: Vec<DeliveryItem>,
}

/// Receiving end of a member's queue.
#[derive(Debug)]
pub struct Mailbox {
    agent_id: String,
    rx: mpsc::Receiver<Delivery>,
}

impl Mailbox {
    pub(crate) fn new(agent_id: String, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { agent_id, rx }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// `None` once the agent has left and the queue is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Routing,
    Delivered,
    Retrying,
    Dropped,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub message_id: Uuid,
    pub status: DeliveryStatus,
    pub route: RoutePattern,
    pub escalated: bool,
    pub delivered: Vec<String>,
    /// Recipients whose copy ended in the dead-letter queue.
    pub failed: Vec<String>,
    pub attempts: u32,
    pub latency_us: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
}

impl DeliveryOutcome {
    /// `Ok` only when every recipient received the message.
    pub fn into_result(self) -> Result<Self, RouterError> {
        match self.status {
            DeliveryStatus::Delivered => Ok(self),
            DeliveryStatus::Cancelled => Err(RouterError::Cancelled(self.message_id)),
            _ => Err(RouterError::RoutingTimeout {
                message_id: self.message_id,
                failed: self.failed,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    RoutingTimeout,
    MailboxClosed,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::RoutingTimeout => "routing_timeout",
            DeadLetterReason::MailboxClosed => "mailbox_closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "routing_timeout" => Some(DeadLetterReason::RoutingTimeout),
            "mailbox_closed" => Some(DeadLetterReason::MailboxClosed),
            _ => None,
        }
    }
}

/// A message copy that could not be delivered after all retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub source_id: String,
    pub recipient: String,
    pub route: RoutePattern,
    pub target: Tier,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub dead_at_ms: u64,
    #[serde(with = "hex_frame")]
    pub frame: Bytes,
}

mod hex_frame {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(frame: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(frame))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}
