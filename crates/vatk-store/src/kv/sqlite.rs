use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use super::{KvResult, KvStore, check_key};

const KV_DB_FILE: &str = "kernel.sqlite";

/// Persistent backing store kept in a single SQLite table.
///
/// Keys use SQLite's default BINARY collation, which orders by UTF-8 bytes
/// exactly like `str` comparison.
#[derive(Debug)]
pub struct SqliteKv {
    conn: Connection,
}

impl SqliteKv {
    /// Open (or create) `<dir>/kernel.sqlite`.
    pub fn open(dir: impl AsRef<Path>) -> KvResult<Self> {
        let conn = Connection::open(dir.as_ref().join(KV_DB_FILE))?;
        conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "full")?;
        Self::init(conn)
    }

    /// Ephemeral database, gone when dropped.
    pub fn in_memory() -> KvResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> KvResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kvStore (
                key TEXT,
                value TEXT,
                PRIMARY KEY (key)
            )",
        )?;
        Ok(Self { conn })
    }
}

impl KvStore for SqliteKv {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM kvStore WHERE key = ?1")?
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str) -> KvResult<()> {
        check_key(key)?;
        self.conn
            .prepare_cached(
                "INSERT INTO kvStore (key, value) VALUES (?1, ?2)
                 ON CONFLICT DO UPDATE SET value = excluded.value",
            )?
            .execute(params![key, value])?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> KvResult<()> {
        self.conn
            .prepare_cached("DELETE FROM kvStore WHERE key = ?1")?
            .execute(params![key])?;
        Ok(())
    }

    fn get_keys(&self, start: &str, end: &str) -> KvResult<Vec<String>> {
        let keys = if end.is_empty() {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT key FROM kvStore WHERE key >= ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![start], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let mut stmt = self.conn.prepare_cached(
                "SELECT key FROM kvStore WHERE key >= ?1 AND key < ?2 ORDER BY key",
            )?;
            let rows = stmt.query_map(params![start, end], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        Ok(keys)
    }

    fn apply_batch(&mut self, batch: Vec<(String, Option<String>)>) -> KvResult<()> {
        let tx = self.conn.transaction()?;
        for (key, value) in &batch {
            match value {
                Some(value) => {
                    check_key(key)?;
                    tx.prepare_cached(
                        "INSERT INTO kvStore (key, value) VALUES (?1, ?2)
                         ON CONFLICT DO UPDATE SET value = excluded.value",
                    )?
                    .execute(params![key, value])?;
                }
                None => {
                    tx.prepare_cached("DELETE FROM kvStore WHERE key = ?1")?
                        .execute(params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
