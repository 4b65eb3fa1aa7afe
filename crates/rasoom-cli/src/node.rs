//! One process's view of the data dir: settings, store and an in-process
//! router populated from the roster.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rasoom_core::Pipeline;
use rasoom_router::{Mailbox, TierRouter};
use rasoom_store::{DataDir, RosterEntry, Settings, Store};

pub struct Node {
    pub dir: DataDir,
    pub settings: Settings,
    pub store: Store,
}

impl Node {
    pub fn open(data_dir: Option<&Path>) -> Result<Self> {
        let dir = DataDir::resolve(data_dir);
        let (settings, found) = dir
            .load_settings()
            .context("failed to load settings")?;
        if !found {
            tracing::warn!(
                "no {} found, running with development defaults",
                dir.settings_path().display()
            );
        }
        let store = dir
            .open_store()
            .with_context(|| format!("failed to open {}", dir.db_path().display()))?;
        Ok(Self {
            dir,
            settings,
            store,
        })
    }

    pub fn pipeline(&self) -> Result<Pipeline> {
        Pipeline::new(self.settings.pipeline.clone()).context("invalid pipeline settings")
    }

    /// Static members from settings, overridden by the persisted roster.
    pub fn members(&self) -> Result<Vec<RosterEntry>> {
        let mut merged: Vec<RosterEntry> = self.settings.members.clone();
        for entry in self.store.roster().context("failed to read roster")? {
            match merged.iter_mut().find(|m| m.agent_id == entry.agent_id) {
                Some(existing) => *existing = entry,
                None => merged.push(entry),
            }
        }
        Ok(merged)
    }

    /// Build a router, join every member and restore stored subscriptions.
    /// Members that cannot join are skipped with a warning.
    pub async fn start_router(&self) -> Result<(TierRouter, HashMap<String, Mailbox>)> {
        let router =
            TierRouter::new(self.settings.router.clone()).context("failed to start router")?;
        let mut mailboxes = HashMap::new();
        for m in self.members()? {
            match router.join(&m.agent_id, m.tier, m.cluster_id.clone()).await {
                Ok(mailbox) => {
                    mailboxes.insert(m.agent_id, mailbox);
                }
                Err(e) => tracing::warn!(agent = %m.agent_id, error = %e, "member skipped"),
            }
        }
        for sub in self.store.subscriptions().context("failed to read subscriptions")? {
            let id = sub.id;
            if !router.restore_subscription(sub).await {
                tracing::debug!(%id, "subscription owner not in roster");
            }
        }
        for p in router.provisioning().await {
            tracing::warn!(tier = %p.tier, members = p.members, min = p.min, "tier under-provisioned");
        }
        Ok((router, mailboxes))
    }

    /// Move the router's dead letters into the store.
    pub async fn persist_dead_letters(&self, router: &TierRouter) -> Result<usize> {
        let letters = router.drain_dead_letters().await;
        if letters.is_empty() {
            return Ok(0);
        }
        self.store
            .insert_dead_letters(&letters)
            .context("failed to persist dead letters")
    }
}
