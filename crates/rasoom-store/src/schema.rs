use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, StoreError};

/// Ordered migrations; entry `i` moves the database to version `i + 1`.
const MIGRATIONS: &[&str] = &["
    CREATE TABLE roster (
        agent_id   TEXT PRIMARY KEY,
        tier       TEXT NOT NULL,
        cluster_id TEXT,
        joined_ms  INTEGER NOT NULL
    );
    CREATE INDEX idx_roster_tier ON roster(tier);

    CREATE TABLE subscriptions (
        id            TEXT PRIMARY KEY,
        agent_id      TEXT NOT NULL,
        topic         TEXT NOT NULL,
        source_filter TEXT,
        created_ms    INTEGER NOT NULL
    );
    CREATE INDEX idx_sub_agent ON subscriptions(agent_id);

    -- one row per undeliverable (message, recipient) pair
    CREATE TABLE dead_letters (
        message_id TEXT NOT NULL,
        recipient  TEXT NOT NULL,
        source_id  TEXT NOT NULL,
        route      TEXT NOT NULL,
        target     TEXT NOT NULL,
        reason     TEXT NOT NULL,
        attempts   INTEGER NOT NULL,
        dead_at_ms INTEGER NOT NULL,
        frame      BLOB NOT NULL,
        PRIMARY KEY (message_id, recipient)
    );
    CREATE INDEX idx_dl_dead_at ON dead_letters(dead_at_ms);
"];

pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Connection pragmas plus any migrations the file has not seen yet.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    // ~400KB between automatic checkpoints
    conn.pragma_update(None, "wal_autocheckpoint", 100)?;

    // Leftover WAL from a crashed process. Fails harmlessly in memory.
    if conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").is_ok() {
        tracing::debug!("startup WAL checkpoint complete");
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;

    let current = get_schema_version(conn)?.unwrap_or(0);
    if current > SCHEMA_VERSION {
        return Err(StoreError::InvalidData(format!(
            "database schema v{current} is newer than this build (v{SCHEMA_VERSION})"
        )));
    }
    for (i, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = i as i64 + 1;
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
            [version.to_string()],
        )?;
        tx.commit()?;
        tracing::info!(version, "schema migrated");
    }
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|v| {
        v.parse::<i64>()
            .map_err(|_| StoreError::InvalidData(format!("bad schema version '{v}'")))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn
    }

    #[test]
    fn test_fresh_database_is_current() {
        let conn = fresh();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
        for table in ["roster", "subscriptions", "dead_letters"] {
            let n: i64 = conn
                .query_row(&format!("SELECT count(*) FROM {table}"), [], |r| r.get(0))
                .unwrap();
            assert_eq!(n, 0, "{table}");
        }
    }

    #[test]
    fn test_reinitialize_skips_applied_migrations() {
        let conn = fresh();
        conn.execute("INSERT INTO roster VALUES ('p-1', 'prime', NULL, 1)", [])
            .unwrap();
        initialize(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT count(*) FROM roster", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = fresh();
        conn.execute(
            "UPDATE metadata SET value = ?1 WHERE key = 'schema_version'",
            [(SCHEMA_VERSION + 1).to_string()],
        )
        .unwrap();
        assert!(matches!(initialize(&conn), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_pragmas_applied() {
        let conn = fresh();
        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |r| r.get(0))
            .unwrap();
        assert_eq!(busy, 5000);
    }

    #[test]
    fn test_dead_letter_key_is_message_and_recipient() {
        let conn = fresh();
        let insert = "INSERT INTO dead_letters VALUES ('m', ?1, 's', 'unicast', 'prime', 'routing_timeout', 4, 0, x'00')";
        conn.execute(insert, ["a"]).unwrap();
        conn.execute(insert, ["b"]).unwrap();
        assert!(conn.execute(insert, ["a"]).is_err());
    }
}
