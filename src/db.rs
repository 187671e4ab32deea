//! SQLite persistence layer.
//!
//! Three tables: one row per document carrying the encoded CRDT state and
//! public flag, one row per `(owner, permlink, account)` permission grant,
//! and an append-only activity log. Uses WAL mode for concurrent reads
//! during writes.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::permissions::{EffectivePermission, PermissionLevel};

/// Database handle wrapping a SQLite connection.
///
/// Callers on the async side go through `spawn_blocking`; the inner mutex
/// serializes access from those worker threads.
pub struct Store {
    db: Mutex<Connection>,
}

/// A persisted document row.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub bytes: Option<Vec<u8>>,
    pub is_public: bool,
    pub last_activity: u64,
}

/// A persisted permission grant.
#[derive(Debug, Clone)]
pub struct PermissionRow {
    pub account: String,
    pub level: PermissionLevel,
    pub granted_by: String,
    pub granted_at: u64,
}

/// One activity log entry.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub account: String,
    pub kind: String,
    pub payload: Option<String>,
    pub created_at: u64,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self { db: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { db: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                owner           TEXT NOT NULL,
                permlink        TEXT NOT NULL,
                document_bytes  BLOB,
                is_public       INTEGER NOT NULL DEFAULT 0,
                edit_count      INTEGER NOT NULL DEFAULT 0,
                last_activity   INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner, permlink)
            );

            CREATE TABLE IF NOT EXISTS permissions (
                owner       TEXT NOT NULL,
                permlink    TEXT NOT NULL,
                account     TEXT NOT NULL,
                level       TEXT NOT NULL,
                granted_by  TEXT NOT NULL,
                granted_at  INTEGER NOT NULL,
                PRIMARY KEY (owner, permlink, account)
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                owner       TEXT NOT NULL,
                permlink    TEXT NOT NULL,
                account     TEXT NOT NULL,
                kind        TEXT NOT NULL,
                payload     TEXT,
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_doc
                ON activity_log(owner, permlink, id);
            ",
        )?;
        Ok(())
    }

    // ── Document store ─────────────────────────────────────────────

    /// Latest persisted state for a document, or None if it has never
    /// been stored.
    pub fn load_document(&self, owner: &str, permlink: &str) -> SqlResult<Option<DocumentRow>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT document_bytes, is_public, last_activity
             FROM documents WHERE owner = ?1 AND permlink = ?2",
            params![owner, permlink],
            |row| {
                Ok(DocumentRow {
                    bytes: row.get(0)?,
                    is_public: row.get::<_, i64>(1)? != 0,
                    last_activity: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()
    }

    /// Overwrite the persisted encoding and stamp activity. Last writer
    /// wins; the owning hub serializes stores for its document.
    pub fn store_document(&self, owner: &str, permlink: &str, bytes: &[u8]) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO documents (owner, permlink, document_bytes, last_activity)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner, permlink) DO UPDATE SET
                 document_bytes = excluded.document_bytes,
                 last_activity = excluded.last_activity",
            params![owner, permlink, bytes, now_secs() as i64],
        )?;
        Ok(())
    }

    /// Bump the edit counter and stamp activity.
    pub fn record_edit(&self, owner: &str, permlink: &str) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO documents (owner, permlink, edit_count, last_activity)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(owner, permlink) DO UPDATE SET
                 edit_count = edit_count + 1,
                 last_activity = excluded.last_activity",
            params![owner, permlink, now_secs() as i64],
        )?;
        Ok(())
    }

    pub fn edit_count(&self, owner: &str, permlink: &str) -> SqlResult<u64> {
        let db = self.db.lock();
        let count: Option<i64> = db
            .query_row(
                "SELECT edit_count FROM documents WHERE owner = ?1 AND permlink = ?2",
                params![owner, permlink],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    pub fn set_public(&self, owner: &str, permlink: &str, public: bool) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO documents (owner, permlink, is_public, last_activity)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner, permlink) DO UPDATE SET is_public = excluded.is_public",
            params![owner, permlink, public as i64, now_secs() as i64],
        )?;
        Ok(())
    }

    pub fn is_public(&self, owner: &str, permlink: &str) -> SqlResult<bool> {
        let db = self.db.lock();
        let public: Option<i64> = db
            .query_row(
                "SELECT is_public FROM documents WHERE owner = ?1 AND permlink = ?2",
                params![owner, permlink],
                |row| row.get(0),
            )
            .optional()?;
        Ok(public.unwrap_or(0) != 0)
    }

    // ── Permission store ───────────────────────────────────────────

    /// Write a single grant. Idempotent on `(owner, permlink, account)`.
    pub fn upsert_permission(
        &self,
        owner: &str,
        permlink: &str,
        account: &str,
        level: PermissionLevel,
        granted_by: &str,
    ) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO permissions (owner, permlink, account, level, granted_by, granted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(owner, permlink, account) DO UPDATE SET
                 level = excluded.level,
                 granted_by = excluded.granted_by,
                 granted_at = excluded.granted_at",
            params![owner, permlink, account, level.as_str(), granted_by, now_secs() as i64],
        )?;
        Ok(())
    }

    pub fn get_permission_row(
        &self,
        owner: &str,
        permlink: &str,
        account: &str,
    ) -> SqlResult<Option<PermissionRow>> {
        let db = self.db.lock();
        db.query_row(
            "SELECT account, level, granted_by, granted_at
             FROM permissions WHERE owner = ?1 AND permlink = ?2 AND account = ?3",
            params![owner, permlink, account],
            |row| {
                let level: String = row.get(1)?;
                Ok(PermissionRow {
                    account: row.get(0)?,
                    level: PermissionLevel::parse(&level).unwrap_or(PermissionLevel::None),
                    granted_by: row.get(2)?,
                    granted_at: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
    }

    pub fn list_permissions(&self, owner: &str, permlink: &str) -> SqlResult<Vec<PermissionRow>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT account, level, granted_by, granted_at
             FROM permissions WHERE owner = ?1 AND permlink = ?2 ORDER BY account",
        )?;
        let rows = stmt.query_map(params![owner, permlink], |row| {
            let level: String = row.get(1)?;
            Ok(PermissionRow {
                account: row.get(0)?,
                level: PermissionLevel::parse(&level).unwrap_or(PermissionLevel::None),
                granted_by: row.get(2)?,
                granted_at: row.get::<_, i64>(3)? as u64,
            })
        })?;
        rows.collect()
    }

    /// Effective permission for an account on a document: owner beats an
    /// explicit row, which beats the public flag, which beats none.
    pub fn resolve_permission(
        &self,
        account: &str,
        owner: &str,
        permlink: &str,
    ) -> SqlResult<EffectivePermission> {
        if account == owner {
            return Ok(PermissionLevel::Owner.into());
        }
        if let Some(row) = self.get_permission_row(owner, permlink, account)? {
            return Ok(row.level.into());
        }
        if self.is_public(owner, permlink)? {
            return Ok(PermissionLevel::Public.into());
        }
        Ok(PermissionLevel::None.into())
    }

    // ── Activity log ───────────────────────────────────────────────

    /// Append one audit entry. Kinds: connect, disconnect, document_edit,
    /// blocked_document_edit.
    pub fn log_activity(
        &self,
        owner: &str,
        permlink: &str,
        account: &str,
        kind: &str,
        payload: Option<&str>,
    ) -> SqlResult<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT INTO activity_log (owner, permlink, account, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![owner, permlink, account, kind, payload, now_secs() as i64],
        )?;
        Ok(())
    }

    /// Most recent activity entries for a document, newest first.
    pub fn recent_activity(
        &self,
        owner: &str,
        permlink: &str,
        limit: usize,
    ) -> SqlResult<Vec<ActivityRow>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT account, kind, payload, created_at
             FROM activity_log WHERE owner = ?1 AND permlink = ?2
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![owner, permlink, limit as i64], |row| {
            Ok(ActivityRow {
                account: row.get(0)?,
                kind: row.get(1)?,
                payload: row.get(2)?,
                created_at: row.get::<_, i64>(3)? as u64,
            })
        })?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_document_bytes() {
        let store = Store::open_memory().unwrap();

        assert!(store.load_document("alice", "welcome").unwrap().is_none());

        store.store_document("alice", "welcome", b"state-v1").unwrap();
        let row = store.load_document("alice", "welcome").unwrap().unwrap();
        assert_eq!(row.bytes.as_deref(), Some(b"state-v1".as_slice()));
        assert!(!row.is_public);

        // Last writer wins
        store.store_document("alice", "welcome", b"state-v2").unwrap();
        let row = store.load_document("alice", "welcome").unwrap().unwrap();
        assert_eq!(row.bytes.as_deref(), Some(b"state-v2".as_slice()));
    }

    #[test]
    fn stored_bytes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dochub.db");
        {
            let store = Store::open(&path).unwrap();
            store.store_document("alice", "welcome", b"persisted").unwrap();
        }
        let store = Store::open(&path).unwrap();
        let row = store.load_document("alice", "welcome").unwrap().unwrap();
        assert_eq!(row.bytes.as_deref(), Some(b"persisted".as_slice()));
    }

    #[test]
    fn edit_counter_accumulates() {
        let store = Store::open_memory().unwrap();
        store.record_edit("alice", "welcome").unwrap();
        store.record_edit("alice", "welcome").unwrap();
        store.record_edit("alice", "welcome").unwrap();
        assert_eq!(store.edit_count("alice", "welcome").unwrap(), 3);
    }

    #[test]
    fn permission_resolution_order() {
        let store = Store::open_memory().unwrap();

        // Owner always wins, even with no rows at all.
        let p = store.resolve_permission("alice", "alice", "welcome").unwrap();
        assert_eq!(p.level, PermissionLevel::Owner);

        // No row, not public → none.
        let p = store.resolve_permission("bob", "alice", "welcome").unwrap();
        assert_eq!(p.level, PermissionLevel::None);
        assert!(!p.can_read);

        // Public flag grants read-only access.
        store.set_public("alice", "welcome", true).unwrap();
        let p = store.resolve_permission("bob", "alice", "welcome").unwrap();
        assert_eq!(p.level, PermissionLevel::Public);
        assert!(p.can_read && !p.can_edit);

        // An explicit row beats the public flag.
        store
            .upsert_permission("alice", "welcome", "bob", PermissionLevel::Editable, "alice")
            .unwrap();
        let p = store.resolve_permission("bob", "alice", "welcome").unwrap();
        assert_eq!(p.level, PermissionLevel::Editable);
        assert!(p.can_edit && !p.can_post_externally);
    }

    #[test]
    fn upsert_permission_is_idempotent_per_key() {
        let store = Store::open_memory().unwrap();
        store
            .upsert_permission("alice", "welcome", "bob", PermissionLevel::Readonly, "alice")
            .unwrap();
        store
            .upsert_permission("alice", "welcome", "bob", PermissionLevel::Editable, "alice")
            .unwrap();

        let rows = store.list_permissions("alice", "welcome").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, PermissionLevel::Editable);
        assert_eq!(rows[0].granted_by, "alice");
    }

    #[test]
    fn activity_log_appends_and_lists_newest_first() {
        let store = Store::open_memory().unwrap();
        store.log_activity("alice", "welcome", "bob", "connect", None).unwrap();
        store
            .log_activity("alice", "welcome", "bob", "blocked_document_edit", Some("{\"level\":\"readonly\"}"))
            .unwrap();

        let rows = store.recent_activity("alice", "welcome", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "blocked_document_edit");
        assert_eq!(rows[0].account, "bob");
        assert_eq!(rows[1].kind, "connect");
    }
}
