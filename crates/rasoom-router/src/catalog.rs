//! Function catalog exposed to agents.
//!
//! The four built-ins are always present. An external registry may add
//! entries but never replaces a built-in; such conflicts are logged and
//! reported, not raised.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const BUILTINS: [&str; 4] = ["send", "subscribe", "health.report", "policy.check"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub builtin: bool,
}

impl FunctionSpec {
    fn builtin(name: &str, description: &str, params: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            builtin: true,
        }
    }
}

/// Functions supplied from outside, e.g. the `[registry]` table of
/// `rasoom.toml`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRegistry {
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: Vec<String>,
    /// External entries that tried to replace a built-in.
    pub conflicts: Vec<String>,
    /// Repeated or unnamed external entries; the first occurrence wins.
    pub skipped: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionCatalog {
    entries: BTreeMap<String, FunctionSpec>,
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FunctionCatalog {
    pub fn builtin() -> Self {
        let specs = [
            FunctionSpec::builtin(
                "send",
                "Route a hex-encoded frame from a member to a tier",
                &["sender_id", "tier_target", "frame", "priority"],
            ),
            FunctionSpec::builtin(
                "subscribe",
                "Copy matching deliveries to an agent's mailbox",
                &["agent_id", "topic", "tier_filter"],
            ),
            FunctionSpec::builtin(
                "health.report",
                "Delivery status, latency and error rate of one member",
                &["agent_id"],
            ),
            FunctionSpec::builtin(
                "policy.check",
                "Whether a sender may address a receiver with the given flags",
                &["sender", "receiver", "payload_flags"],
            ),
        ];
        Self {
            entries: specs.into_iter().map(|s| (s.name.clone(), s)).collect(),
        }
    }

    pub fn with_registry(registry: &ExternalRegistry) -> (Self, MergeReport) {
        let mut catalog = Self::builtin();
        let report = catalog.merge(registry);
        (catalog, report)
    }

    pub fn merge(&mut self, registry: &ExternalRegistry) -> MergeReport {
        let mut report = MergeReport::default();
        for spec in &registry.functions {
            let name = spec.name.trim();
            if BUILTINS.contains(&name) {
                warn!(function = name, "external registry entry conflicts with a built-in; ignored");
                report.conflicts.push(name.to_string());
                continue;
            }
            if name.is_empty() || self.entries.contains_key(name) {
                report.skipped.push(name.to_string());
                continue;
            }
            self.entries.insert(
                name.to_string(),
                FunctionSpec {
                    name: name.to_string(),
                    builtin: false,
                    ..spec.clone()
                },
            );
            report.added.push(name.to_string());
        }
        report
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.entries.get(name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionSpec> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
