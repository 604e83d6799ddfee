//! SQLite implementation of [`Relations`].

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::StoreResult;
use crate::traits::{ObjectRow, Relations, TxMode};

const SCHEMA: &str = r#"
    DROP TABLE IF EXISTS arrays;
    DROP TABLE IF EXISTS members;
    DROP TABLE IF EXISTS objects;

    CREATE TABLE objects (
        id INTEGER PRIMARY KEY,
        class_name TEXT DEFAULT NULL UNIQUE,
        value BLOB DEFAULT NULL,
        gc BOOLEAN NOT NULL DEFAULT 0
    );

    -- Target references use the default NO ACTION: checked at statement
    -- end, so one sweep may delete garbage that references itself.
    CREATE TABLE members (
        id INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
        member_name TEXT NOT NULL,
        member_id INTEGER DEFAULT NULL REFERENCES objects(id),
        PRIMARY KEY (id, member_name)
    );

    CREATE TABLE arrays (
        id INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
        "index" INTEGER NOT NULL,
        object INTEGER DEFAULT NULL REFERENCES objects(id),
        PRIMARY KEY (id, "index")
    );

    CREATE INDEX members_target ON members(member_id);
    CREATE INDEX arrays_target ON arrays(object);
"#;

/// The three relations in one SQLite database.
pub struct SqliteRelations {
    conn: Connection,
}

impl SqliteRelations {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::configure(conn, busy_timeout)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::configure(Connection::open_in_memory()?, Duration::ZERO)
    }

    fn configure(conn: Connection, busy_timeout: Duration) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self { conn })
    }
}

impl Relations for SqliteRelations {
    fn begin(&mut self, mode: TxMode) -> StoreResult<()> {
        let sql = match mode {
            TxMode::Deferred => "BEGIN DEFERRED",
            TxMode::Immediate => "BEGIN IMMEDIATE",
            TxMode::Exclusive => "BEGIN EXCLUSIVE",
        };
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn reset_schema(&mut self) -> StoreResult<()> {
        debug!("recreating object relations");
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn next_id(&mut self) -> StoreResult<i64> {
        let next: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) + 1 FROM objects", [], |row| row.get(0))?;
        Ok(next.unwrap_or(0))
    }

    fn fetch_object(&mut self, id: i64) -> StoreResult<Option<ObjectRow>> {
        let row = self
            .conn
            .prepare_cached("SELECT class_name, value FROM objects WHERE id = ?1")?
            .query_row(params![id], |row| {
                Ok(ObjectRow {
                    class_name: row.get(0)?,
                    value: row.get(1)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    fn find_class(&mut self, class_name: &str) -> StoreResult<Option<i64>> {
        let id = self
            .conn
            .prepare_cached("SELECT id FROM objects WHERE class_name = ?1")?
            .query_row(params![class_name], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    fn insert_object(
        &mut self,
        id: i64,
        class_name: Option<&str>,
        value: Option<&[u8]>,
    ) -> StoreResult<()> {
        self.conn
            .prepare_cached("INSERT INTO objects (id, class_name, value) VALUES (?1, ?2, ?3)")?
            .execute(params![id, class_name, value])?;
        Ok(())
    }

    fn update_value(&mut self, id: i64, value: Option<&[u8]>) -> StoreResult<()> {
        self.conn
            .prepare_cached("UPDATE objects SET value = ?2 WHERE id = ?1")?
            .execute(params![id, value])?;
        Ok(())
    }

    fn members(&mut self, id: i64) -> StoreResult<Vec<(String, Option<i64>)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT member_name, member_id FROM members WHERE id = ?1")?;
        let rows = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn insert_member(&mut self, id: i64, name: &str, member_id: Option<i64>) -> StoreResult<()> {
        self.conn
            .prepare_cached("INSERT INTO members (id, member_name, member_id) VALUES (?1, ?2, ?3)")?
            .execute(params![id, name, member_id])?;
        Ok(())
    }

    fn delete_members(&mut self, id: i64) -> StoreResult<()> {
        self.conn
            .prepare_cached("DELETE FROM members WHERE id = ?1")?
            .execute(params![id])?;
        Ok(())
    }

    fn array_len(&mut self, id: i64) -> StoreResult<usize> {
        let len: i64 = self
            .conn
            .prepare_cached(r#"SELECT COALESCE(MAX("index") + 1, 0) FROM arrays WHERE id = ?1"#)?
            .query_row(params![id], |row| row.get(0))?;
        Ok(len.max(0) as usize)
    }

    fn array_element(&mut self, id: i64, index: usize) -> StoreResult<Option<i64>> {
        let object: Option<Option<i64>> = self
            .conn
            .prepare_cached(r#"SELECT object FROM arrays WHERE id = ?1 AND "index" = ?2"#)?
            .query_row(params![id, index as i64], |row| row.get(0))
            .optional()?;
        Ok(object.flatten())
    }

    fn upsert_element(&mut self, id: i64, index: usize, object: Option<i64>) -> StoreResult<()> {
        self.conn
            .prepare_cached(
                r#"INSERT INTO arrays (id, "index", object) VALUES (?1, ?2, ?3)
                   ON CONFLICT (id, "index") DO UPDATE SET object = excluded.object"#,
            )?
            .execute(params![id, index as i64, object])?;
        Ok(())
    }

    fn mark(&mut self, id: i64) -> StoreResult<usize> {
        Ok(self
            .conn
            .execute("UPDATE objects SET gc = 1 WHERE id = ?1", params![id])?)
    }

    fn mark_member_targets(&mut self) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "UPDATE objects SET gc = 1 WHERE gc = 0 AND id IN (
                SELECT members.member_id FROM members
                JOIN objects AS owner ON owner.id = members.id
                WHERE owner.gc = 1 AND members.member_id IS NOT NULL)",
            [],
        )?)
    }

    fn mark_array_targets(&mut self) -> StoreResult<usize> {
        Ok(self.conn.execute(
            "UPDATE objects SET gc = 1 WHERE gc = 0 AND id IN (
                SELECT arrays.object FROM arrays
                JOIN objects AS owner ON owner.id = arrays.id
                WHERE owner.gc = 1 AND arrays.object IS NOT NULL)",
            [],
        )?)
    }

    fn sweep(&mut self) -> StoreResult<usize> {
        Ok(self.conn.execute("DELETE FROM objects WHERE gc = 0", [])?)
    }

    fn clear_marks(&mut self) -> StoreResult<()> {
        self.conn
            .execute("UPDATE objects SET gc = 0 WHERE gc = 1", [])?;
        Ok(())
    }

    fn vacuum(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    fn object_count(&mut self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}
