//! Tier-aware routing for Rasoom frames.
//!
//! A `TierRouter` owns the roster, subscriptions, health and dead letters
//! for one process. Policy is pure and lives in `policy`; delivery is async
//! with bounded retries. `ProtocolAdapter` exposes the function catalog
//! (`send`, `subscribe`, `health.report`, `policy.check`) on top of it.

pub mod adapter;
mod aggregator;
pub mod catalog;
pub mod config;
pub mod delivery;
pub mod error;
pub mod health;
pub mod policy;
pub mod router;
pub mod state;
pub mod subscription;

pub use adapter::{
    LegacyCommand, PolicyCheckRequest, PolicyVerdict, ProtocolAdapter, SendAck, SendRequest,
    SubscribeRequest,
};
pub use catalog::{BUILTINS, ExternalRegistry, FunctionCatalog, FunctionSpec, MergeReport};
pub use config::{AggregationWindow, LatencyBudgets, RetryPolicy, RouterConfig, TierBounds, TierLimits};
pub use delivery::{
    DeadLetter, DeadLetterReason, Delivery, DeliveryItem, DeliveryOutcome, DeliveryStatus, Mailbox,
};
pub use error::{Result, RouterError};
pub use health::{HealthReport, HealthStatus};
pub use policy::{PayloadFlags, RouteDecision, RoutePattern};
pub use router::{Outbound, RouterEvent, SendReceipt, TierRouter};
pub use state::{MemberInfo, Provisioning, RouterStats};
pub use subscription::{Subscription, Topic};
