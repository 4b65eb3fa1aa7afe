use rasoom_core::{PipelineError, Tier};
use thiserror::Error;
use uuid::Uuid;

use crate::policy::RoutePattern;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("agent '{0}' has already joined")]
    AlreadyJoined(String),

    #[error("{tier} tier is full ({max} members)")]
    CapacityExceeded { tier: Tier, max: usize },

    #[error("no {target} recipients for {pattern} route")]
    NoRecipients { target: Tier, pattern: RoutePattern },

    #[error("message {message_id} timed out for {} recipient(s)", failed.len())]
    RoutingTimeout { message_id: Uuid, failed: Vec<String> },

    #[error("message {0} was cancelled")]
    Cancelled(Uuid),

    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("unknown subscription {0}")]
    UnknownSubscription(Uuid),

    #[error("no handler for function '{0}'")]
    UnknownFunction(String),

    #[error("invalid arguments for '{function}': {reason}")]
    InvalidArguments { function: String, reason: String },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid router config: {0}")]
    Config(String),

    #[error("router requires a running Tokio runtime")]
    NoRuntime,

    #[error("router is shut down")]
    Shutdown,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
