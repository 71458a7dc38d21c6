use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::state::{NodeId, ShortChannelId};
use crate::swaps::{LoopInRecord, LoopOutRecord, SwapState, SwapStore};

/// Swap-record database shared with the swap execution subsystem.
///
/// This crate only ever reads swap rows; the schema is created idempotently so
/// a fresh database (or a test) starts from a known layout.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        // Enable WAL mode so we never block the writer
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
-- Loop out swaps; outgoing_chan_set is a comma-separated list of short channel ids
CREATE TABLE IF NOT EXISTS loop_out_swaps (
    swap_hash TEXT NOT NULL PRIMARY KEY,
    state TEXT NOT NULL,
    outgoing_chan_set TEXT NOT NULL DEFAULT '',
    last_update REAL NOT NULL
);

-- Loop in swaps; last_hop is the hex node id, NULL when unrestricted
CREATE TABLE IF NOT EXISTS loop_in_swaps (
    swap_hash TEXT NOT NULL PRIMARY KEY,
    state TEXT NOT NULL,
    last_hop TEXT,
    last_update REAL NOT NULL
);
"#;

fn timestamp(secs: f64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64)
        .single()
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", secs))
}

fn parse_chan_set(raw: &str) -> anyhow::Result<Vec<ShortChannelId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .collect()
}

impl SwapStore for Database {
    fn list_loop_out(&self) -> anyhow::Result<Vec<LoopOutRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT swap_hash, state, outgoing_chan_set, last_update \
             FROM loop_out_swaps ORDER BY last_update ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut swaps = Vec::new();
        for row in rows {
            let (swap_hash, state, chan_set, last_update) = row?;
            swaps.push(LoopOutRecord {
                state: state
                    .parse()
                    .with_context(|| format!("loop out {}", swap_hash))?,
                outgoing_chan_set: parse_chan_set(&chan_set)
                    .with_context(|| format!("loop out {} channel set", swap_hash))?,
                last_update: timestamp(last_update)?,
                swap_hash,
            });
        }
        Ok(swaps)
    }

    fn list_loop_in(&self) -> anyhow::Result<Vec<LoopInRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT swap_hash, state, last_hop, last_update \
             FROM loop_in_swaps ORDER BY last_update ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut swaps = Vec::new();
        for row in rows {
            let (swap_hash, state, last_hop, last_update) = row?;
            let last_hop = match last_hop.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(hex) => Some(
                    hex.parse::<NodeId>()
                        .with_context(|| format!("loop in {} last hop", swap_hash))?,
                ),
            };
            swaps.push(LoopInRecord {
                state: state.parse::<SwapState>()?,
                last_hop,
                last_update: timestamp(last_update)?,
                swap_hash,
            });
        }
        Ok(swaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::fixtures::node;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.conn().is_autocommit());
    }

    #[test]
    fn test_schema_tables_exist() {
        let db = Database::open_in_memory().unwrap();
        let tables: Vec<String> = {
            let conn = db.conn();
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            let names: Vec<String> = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect();
            names
        };

        assert_eq!(tables, vec!["loop_in_swaps", "loop_out_swaps"]);
    }

    #[test]
    fn test_migrate_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
    }

    #[test]
    fn test_list_loop_out() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO loop_out_swaps (swap_hash, state, outgoing_chan_set, last_update) \
                 VALUES ('a', 'initiated', '123, 456', 1704067200.0), \
                        ('b', 'failed_offchain_payments', '', 1704067300.5)",
                [],
            )
            .unwrap();

        let swaps = db.list_loop_out().unwrap();
        assert_eq!(swaps.len(), 2);
        assert_eq!(swaps[0].swap_hash, "a");
        assert_eq!(swaps[0].state, SwapState::Initiated);
        assert_eq!(
            swaps[0].outgoing_chan_set,
            vec![ShortChannelId::from_u64(123), ShortChannelId::from_u64(456)]
        );
        assert_eq!(swaps[0].last_update.timestamp(), 1_704_067_200);
        assert!(swaps[1].outgoing_chan_set.is_empty());
        assert_eq!(swaps[1].last_update.timestamp_millis(), 1_704_067_300_500);
    }

    #[test]
    fn test_list_loop_in() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO loop_in_swaps (swap_hash, state, last_hop, last_update) \
                 VALUES ('a', 'htlc_published', ?1, 1704067200.0), \
                        ('b', 'initiated', NULL, 1704067201.0)",
                [node(9).to_string()],
            )
            .unwrap();

        let swaps = db.list_loop_in().unwrap();
        assert_eq!(swaps[0].last_hop, Some(node(9)));
        assert_eq!(swaps[1].last_hop, None);
    }

    #[test]
    fn test_unknown_state_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO loop_out_swaps (swap_hash, state, last_update) \
                 VALUES ('a', 'mystery', 1.0)",
                [],
            )
            .unwrap();
        assert!(db.list_loop_out().is_err());
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swaps.db");
        {
            let db = Database::open(&path).unwrap();
            db.conn()
                .execute(
                    "INSERT INTO loop_in_swaps (swap_hash, state, last_update) \
                     VALUES ('x', 'success', 5.0)",
                    [],
                )
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_loop_in().unwrap().len(), 1);
    }
}
