use std::path::Path;

use bytes::Bytes;
use rasoom_core::Tier;
use rasoom_router::{DeadLetter, DeadLetterReason, RoutePattern, Subscription, Topic};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::schema;
use crate::settings::RosterEntry;

const LAST_SHUTDOWN_KEY: &str = "last_shutdown_ms";

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        schema::get_schema_version(&self.conn)
    }

    /// Stamp a clean server stop.
    pub fn mark_shutdown(&self, at_ms: u64) -> Result<()> {
        self.set_metadata(LAST_SHUTDOWN_KEY, &at_ms.to_string())
    }

    pub fn last_shutdown_ms(&self) -> Result<Option<u64>> {
        self.get_metadata(LAST_SHUTDOWN_KEY)?
            .map(|v| {
                v.parse()
                    .map_err(|_| StoreError::InvalidData(format!("bad {LAST_SHUTDOWN_KEY} '{v}'")))
            })
            .transpose()
    }

    // --- Roster ---

    /// Insert or replace a member. Rejoining keeps the original join time.
    pub fn upsert_member(&self, entry: &RosterEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO roster (agent_id, tier, cluster_id, joined_ms) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET tier = excluded.tier, cluster_id = excluded.cluster_id",
            params![
                entry.agent_id,
                entry.tier.as_str(),
                entry.cluster_id,
                entry.joined_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, agent_id: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = tx.execute("DELETE FROM roster WHERE agent_id = ?1", [agent_id])?;
        tx.execute("DELETE FROM subscriptions WHERE agent_id = ?1", [agent_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Members ordered by tier, then id.
    pub fn roster(&self) -> Result<Vec<RosterEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT agent_id, tier, cluster_id, joined_ms FROM roster
             ORDER BY CASE tier WHEN 'prime' THEN 1 WHEN 'domain' THEN 2 ELSE 3 END, agent_id",
        )?;
        let rows: Vec<(String, String, Option<String>, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(agent_id, tier, cluster_id, joined_ms)| {
                Ok(RosterEntry {
                    agent_id,
                    tier: parse_tier(&tier)?,
                    cluster_id,
                    joined_ms: joined_ms.max(0) as u64,
                })
            })
            .collect()
    }

    // --- Subscriptions ---

    pub fn save_subscription(&self, sub: &Subscription) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO subscriptions (id, agent_id, topic, source_filter, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sub.id.to_string(),
                sub.agent_id,
                sub.topic.to_string(),
                sub.source_filter.map(Tier::as_str),
                sub.created_ms as i64,
            ],
        )?;
        Ok(())
    }

    pub fn delete_subscription(&self, id: Uuid) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM subscriptions WHERE id = ?1", [id.to_string()])?;
        Ok(rows > 0)
    }

    pub fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, topic, source_filter, created_ms FROM subscriptions ORDER BY created_ms, rowid",
        )?;
        let rows: Vec<(String, String, String, Option<String>, i64)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(id, agent_id, topic, filter, created_ms)| {
                Ok(Subscription {
                    id: parse_uuid(&id)?,
                    agent_id,
                    topic: topic
                        .parse::<Topic>()
                        .map_err(|e| StoreError::InvalidData(e.to_string()))?,
                    source_filter: filter.as_deref().map(parse_tier).transpose()?,
                    created_ms: created_ms.max(0) as u64,
                })
            })
            .collect()
    }

    // --- Dead letters ---

    /// Returns how many were new. A letter already stored for the same
    /// message and recipient is replaced.
    pub fn insert_dead_letters(&self, letters: &[DeadLetter]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO dead_letters
                 (message_id, recipient, source_id, route, target, reason, attempts, dead_at_ms, frame)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for dl in letters {
                let existed: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM dead_letters WHERE message_id = ?1 AND recipient = ?2)",
                    params![dl.message_id.to_string(), dl.recipient],
                    |row| row.get(0),
                )?;
                stmt.execute(params![
                    dl.message_id.to_string(),
                    dl.recipient,
                    dl.source_id,
                    dl.route.as_str(),
                    dl.target.as_str(),
                    dl.reason.as_str(),
                    dl.attempts,
                    dl.dead_at_ms as i64,
                    &dl.frame[..],
                ])?;
                if !existed {
                    inserted += 1;
                }
            }
        }
        tx.commit()?;
        if inserted > 0 {
            tracing::debug!(inserted, "dead letters persisted");
        }
        Ok(inserted)
    }

    /// Newest first.
    pub fn dead_letters(&self, limit: Option<usize>) -> Result<Vec<DeadLetter>> {
        let limit = limit.map_or(-1, |n| n.min(i64::MAX as usize) as i64);
        let mut stmt = self.conn.prepare(
            "SELECT message_id, recipient, source_id, route, target, reason, attempts, dead_at_ms, frame
             FROM dead_letters ORDER BY dead_at_ms DESC, rowid DESC LIMIT ?1",
        )?;
        let rows: Vec<DeadLetterRow> = stmt
            .query_map([limit], DeadLetterRow::from_row)?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(DeadLetterRow::into_letter).collect()
    }

    pub fn dead_letter_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Delete dead letters older than `before_ms`, or all of them.
    pub fn purge_dead_letters(&self, before_ms: Option<u64>) -> Result<usize> {
        let rows = match before_ms {
            Some(ms) => self
                .conn
                .execute("DELETE FROM dead_letters WHERE dead_at_ms < ?1", [ms as i64])?,
            None => self.conn.execute("DELETE FROM dead_letters", [])?,
        };
        tracing::info!(purged = rows, "dead letters purged");
        Ok(rows)
    }

    // --- Maintenance ---

    /// Bytes used by the main database file.
    pub fn db_size(&self) -> Result<u64> {
        let pages: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self
            .conn
            .query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok((pages.max(0) * page_size.max(0)) as u64)
    }

    /// Fold the WAL into the main file and truncate it.
    pub fn checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

struct DeadLetterRow {
    message_id: String,
    recipient: String,
    source_id: String,
    route: String,
    target: String,
    reason: String,
    attempts: u32,
    dead_at_ms: i64,
    frame: Vec<u8>,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            message_id: row.get(0)?,
            recipient: row.get(1)?,
            source_id: row.get(2)?,
            route: row.get(3)?,
            target: row.get(4)?,
            reason: row.get(5)?,
            attempts: row.get(6)?,
            dead_at_ms: row.get(7)?,
            frame: row.get(8)?,
        })
    }

    fn into_letter(self) -> Result<DeadLetter> {
        Ok(DeadLetter {
            message_id: parse_uuid(&self.message_id)?,
            source_id: self.source_id,
            recipient: self.recipient,
            route: self
                .route
                .parse::<RoutePattern>()
                .map_err(StoreError::InvalidData)?,
            target: parse_tier(&self.target)?,
            reason: DeadLetterReason::parse(&self.reason).ok_or_else(|| {
                StoreError::InvalidData(format!("unknown dead-letter reason '{}'", self.reason))
            })?,
            attempts: self.attempts,
            dead_at_ms: self.dead_at_ms.max(0) as u64,
            frame: Bytes::from(self.frame),
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidData(format!("invalid UUID '{s}': {e}")))
}

fn parse_tier(s: &str) -> Result<Tier> {
    s.parse().map_err(StoreError::InvalidData)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(recipient: &str, dead_at_ms: u64) -> DeadLetter {
        DeadLetter {
            message_id: Uuid::new_v4(),
            source_id: "p-1".into(),
            recipient: recipient.into(),
            route: RoutePattern::ClusterMulticast,
            target: Tier::Domain,
            reason: DeadLetterReason::RoutingTimeout,
            attempts: 4,
            dead_at_ms,
            frame: Bytes::from_static(&[1, 0, 0, 0xff]),
        }
    }

    fn member(agent_id: &str, tier: Tier, cluster: Option<&str>) -> RosterEntry {
        RosterEntry {
            agent_id: agent_id.into(),
            tier,
            cluster_id: cluster.map(String::from),
            joined_ms: 100,
        }
    }

    #[test]
    fn test_shutdown_stamp() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.last_shutdown_ms().unwrap(), None);
        store.mark_shutdown(1_700_000_000_123).unwrap();
        assert_eq!(store.last_shutdown_ms().unwrap(), Some(1_700_000_000_123));

        store.set_metadata(LAST_SHUTDOWN_KEY, "soon").unwrap();
        assert!(matches!(store.last_shutdown_ms(), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_roster_ordered_by_tier() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_member(&member("m-1", Tier::Micro, None)).unwrap();
        store.upsert_member(&member("d-1", Tier::Domain, Some("c1"))).unwrap();
        store.upsert_member(&member("p-1", Tier::Prime, None)).unwrap();

        let ids: Vec<String> = store.roster().unwrap().into_iter().map(|e| e.agent_id).collect();
        assert_eq!(ids, ["p-1", "d-1", "m-1"]);
    }

    #[test]
    fn test_rejoin_keeps_join_time() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_member(&member("d-1", Tier::Domain, Some("c1"))).unwrap();
        let mut moved = member("d-1", Tier::Domain, Some("c2"));
        moved.joined_ms = 999;
        store.upsert_member(&moved).unwrap();

        let roster = store.roster().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].cluster_id.as_deref(), Some("c2"));
        assert_eq!(roster[0].joined_ms, 100);
    }

    #[test]
    fn test_remove_member_drops_subscriptions() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_member(&member("d-1", Tier::Domain, None)).unwrap();
        let sub = Subscription {
            id: Uuid::new_v4(),
            agent_id: "d-1".into(),
            topic: "micro.*".parse().unwrap(),
            source_filter: Some(Tier::Domain),
            created_ms: 5,
        };
        store.save_subscription(&sub).unwrap();
        assert_eq!(store.subscriptions().unwrap(), vec![sub]);

        assert!(store.remove_member("d-1").unwrap());
        assert!(!store.remove_member("d-1").unwrap());
        assert!(store.subscriptions().unwrap().is_empty());
    }

    #[test]
    fn test_delete_subscription() {
        let store = Store::open_in_memory().unwrap();
        let sub = Subscription {
            id: Uuid::new_v4(),
            agent_id: "p-1".into(),
            topic: "*".parse().unwrap(),
            source_filter: None,
            created_ms: 1,
        };
        store.save_subscription(&sub).unwrap();
        assert!(store.delete_subscription(sub.id).unwrap());
        assert!(!store.delete_subscription(sub.id).unwrap());
    }

    #[test]
    fn test_dead_letters_roundtrip_newest_first() {
        let store = Store::open_in_memory().unwrap();
        let old = letter("d-1", 10);
        let new = letter("d-2", 20);
        assert_eq!(store.insert_dead_letters(&[old.clone(), new.clone()]).unwrap(), 2);

        let all = store.dead_letters(None).unwrap();
        assert_eq!(all, vec![new.clone(), old]);
        assert_eq!(store.dead_letters(Some(1)).unwrap(), vec![new]);
        assert_eq!(store.dead_letter_count().unwrap(), 2);
    }

    #[test]
    fn test_dead_letter_reinsert_is_not_new() {
        let store = Store::open_in_memory().unwrap();
        let mut dl = letter("d-1", 10);
        store.insert_dead_letters(std::slice::from_ref(&dl)).unwrap();
        dl.attempts = 7;
        assert_eq!(store.insert_dead_letters(std::slice::from_ref(&dl)).unwrap(), 0);
        assert_eq!(store.dead_letters(None).unwrap()[0].attempts, 7);
    }

    #[test]
    fn test_purge_dead_letters() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_dead_letters(&[letter("a", 10), letter("b", 20), letter("c", 30)])
            .unwrap();
        assert_eq!(store.purge_dead_letters(Some(25)).unwrap(), 2);
        assert_eq!(store.dead_letter_count().unwrap(), 1);
        assert_eq!(store.purge_dead_letters(None).unwrap(), 1);
        assert_eq!(store.dead_letter_count().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_row_is_invalid_data() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO roster (agent_id, tier, cluster_id, joined_ms) VALUES ('x', 'galaxy', NULL, 0)",
                [],
            )
            .unwrap();
        assert!(matches!(store.roster(), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_db_size_nonzero() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.db_size().unwrap() > 0);
    }
}
