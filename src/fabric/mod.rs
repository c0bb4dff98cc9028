use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, params};

use crate::error::{Result, TychoError};
use crate::model::{
    Claim, Discovery, DiscoveryKind, Entanglement, EntanglementKind, EntanglementStatus,
    MemoryEntry, TaskState,
};

pub mod lock;

pub use lock::EpochLock;

// ---------------------------------------------------------------------------
// Row views
// ---------------------------------------------------------------------------

/// Task state row with its last-transition timestamp. Feeds stale detection.
#[derive(Debug, Clone, PartialEq)]
pub struct StateInfo {
    pub task_id: String,
    pub state: TaskState,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Helpers: timestamps from SQLite TEXT columns
// ---------------------------------------------------------------------------

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite's
/// `YYYY-MM-DD HH:MM:SS`; anything else falls back to now.
fn parse_dt(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return naive.and_utc();
    }
    Utc::now()
}

fn bad_column(
    idx: usize,
    what: &str,
    value: &str,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {what} '{value}'").into(),
    )
}

fn state_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<TaskState> {
    let raw: String = row.get(idx)?;
    TaskState::parse(&raw).ok_or_else(|| bad_column(idx, "task state", &raw))
}

fn kind_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<EntanglementKind> {
    let raw: String = row.get(idx)?;
    EntanglementKind::parse(&raw).ok_or_else(|| bad_column(idx, "entanglement kind", &raw))
}

fn status_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<EntanglementStatus> {
    let raw: String = row.get(idx)?;
    EntanglementStatus::parse(&raw).ok_or_else(|| bad_column(idx, "entanglement status", &raw))
}

fn discovery_kind_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DiscoveryKind> {
    let raw: String = row.get(idx)?;
    DiscoveryKind::parse(&raw).ok_or_else(|| bad_column(idx, "discovery kind", &raw))
}

fn entanglement_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entanglement> {
    Ok(Entanglement {
        id: row.get(0)?,
        producer_task_id: row.get(1)?,
        consumer_task_id: row.get(2)?,
        kind: kind_column(row, 3)?,
        name: row.get(4)?,
        signature: row.get(5)?,
        package: row.get(6)?,
        file_path: row.get(7)?,
        status: status_column(row, 8)?,
        created_at: parse_dt(&row.get::<_, String>(9)?),
    })
}

const ENTANGLEMENT_COLUMNS: &str = "id, producer_task_id, consumer_task_id, kind, name, \
     signature, package, file_path, status, created_at";

fn discovery_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Discovery> {
    Ok(Discovery {
        id: row.get(0)?,
        source_task_id: row.get(1)?,
        kind: discovery_kind_column(row, 2)?,
        detail: row.get(3)?,
        affected_task_id: row.get(4)?,
        resolved: row.get(5)?,
        created_at: parse_dt(&row.get::<_, String>(6)?),
    })
}

const DISCOVERY_COLUMNS: &str =
    "id, source_task_id, kind, detail, affected_task_id, resolved, created_at";

// ---------------------------------------------------------------------------
// Fabric
// ---------------------------------------------------------------------------

/// The shared coordination store. One SQLite file, WAL journaling, all
/// writers serialized through the inner mutex. The handle is cheap to share
/// behind an `Arc`; readers tolerate the configured busy timeout under
/// contention.
pub struct Fabric {
    conn: Mutex<Connection>,
    dir: Option<std::path::PathBuf>,
}

impl Fabric {
    /// Open (or create) the fabric database at the given file path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        let fabric = Self {
            conn: Mutex::new(conn),
            dir: path.parent().map(Path::to_path_buf),
        };
        fabric.create_tables()?;
        Ok(fabric)
    }

    /// Open an in-memory fabric (for tests).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        let fabric = Self {
            conn: Mutex::new(conn),
            dir: None,
        };
        fabric.create_tables()?;
        Ok(fabric)
    }

    /// Convenience: open `<dir>/fabric.db`, creating the directory if needed.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Self::open(&dir.join("fabric.db"))
    }

    /// Take the advisory epoch lock beside the database file. `None` for
    /// in-memory fabrics, which cannot be shared between processes anyway.
    pub fn epoch_lock(&self) -> Result<Option<EpochLock>> {
        match &self.dir {
            Some(dir) => Ok(Some(EpochLock::acquire(dir)?)),
            None => Ok(None),
        }
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task_states (
                task_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entanglements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                producer_task_id TEXT NOT NULL CHECK (producer_task_id <> ''),
                consumer_task_id TEXT,
                kind TEXT NOT NULL,
                name TEXT NOT NULL CHECK (name <> ''),
                signature TEXT NOT NULL DEFAULT '',
                package TEXT NOT NULL DEFAULT '',
                file_path TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                UNIQUE (producer_task_id, kind, name)
            );
            CREATE INDEX IF NOT EXISTS idx_entanglements_producer
                ON entanglements(producer_task_id);

            CREATE TABLE IF NOT EXISTS claims (
                filepath TEXT PRIMARY KEY,
                owner_task_id TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_claims_owner
                ON claims(owner_task_id);

            CREATE TABLE IF NOT EXISTS discoveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT NOT NULL,
                affected_task_id TEXT,
                resolved INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_discoveries_resolved
                ON discoveries(resolved);

            CREATE TABLE IF NOT EXISTS memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_task
                ON memory(task_id);",
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("fabric mutex poisoned")
    }

    /// Run a closure against the raw connection (tests, advanced usage).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> T) -> T {
        let conn = self.lock_conn();
        f(&conn)
    }

    /// Release the underlying connection. Dropping the fabric has the same
    /// effect; `close` surfaces the final I/O result.
    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .expect("fabric mutex poisoned");
        conn.close().map_err(|(_, e)| TychoError::Db(e))
    }

    // -----------------------------------------------------------------------
    // Task states
    // -----------------------------------------------------------------------

    /// Upsert the lifecycle state for a task.
    pub fn set_state(&self, task_id: &str, state: TaskState) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO task_states (task_id, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(task_id) DO UPDATE SET state = ?2, updated_at = ?3",
            params![task_id, state.to_string(), &now],
        )?;
        Ok(())
    }

    /// The task's state, or `None` if it has no record.
    pub fn get_state(&self, task_id: &str) -> Result<Option<TaskState>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT state FROM task_states WHERE task_id = ?1")?;
        match stmt.query_row(params![task_id], |row| state_column(row, 0)) {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every recorded state, keyed by task id (lexicographic iteration).
    pub fn all_states(&self) -> Result<BTreeMap<String, TaskState>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT task_id, state FROM task_states ORDER BY task_id")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, state_column(row, 1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (id, state) = row?;
            out.insert(id, state);
        }
        Ok(out)
    }

    /// State rows with transition timestamps, ordered by task id.
    pub fn state_info(&self) -> Result<Vec<StateInfo>> {
        let conn = self.lock_conn();
        let mut stmt = conn
            .prepare("SELECT task_id, state, updated_at FROM task_states ORDER BY task_id")?;
        let rows = stmt.query_map([], |row| {
            Ok(StateInfo {
                task_id: row.get(0)?,
                state: state_column(row, 1)?,
                updated_at: parse_dt(&row.get::<_, String>(2)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Entanglements
    // -----------------------------------------------------------------------

    fn publish_in(conn: &Connection, e: &Entanglement) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO entanglements
                 (producer_task_id, consumer_task_id, kind, name, signature,
                  package, file_path, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(producer_task_id, kind, name) DO UPDATE SET
                consumer_task_id = ?2,
                signature = ?5,
                package = ?6,
                file_path = ?7,
                status = ?8",
            params![
                e.producer_task_id,
                e.consumer_task_id,
                e.kind.to_string(),
                e.name,
                e.signature,
                e.package,
                e.file_path,
                e.status.to_string(),
                &now,
            ],
        )?;
        // The row keeps its original id across upserts; read it back rather
        // than trusting last_insert_rowid after a conflict.
        let id = conn.query_row(
            "SELECT id FROM entanglements
             WHERE producer_task_id = ?1 AND kind = ?2 AND name = ?3",
            params![e.producer_task_id, e.kind.to_string(), e.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Publish one entanglement; upserts on (producer, kind, name) and
    /// returns the row id (stable across upserts).
    pub fn publish(&self, e: &Entanglement) -> Result<i64> {
        let conn = self.lock_conn();
        Self::publish_in(&conn, e)
    }

    /// Publish a batch atomically: either every entanglement lands or none.
    pub fn publish_batch(&self, batch: &[Entanglement]) -> Result<Vec<i64>> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(batch.len());
        for e in batch {
            ids.push(Self::publish_in(&tx, e)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// All entanglements produced by the given task, insertion order.
    pub fn entanglements_for(&self, task_id: &str) -> Result<Vec<Entanglement>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTANGLEMENT_COLUMNS} FROM entanglements
             WHERE producer_task_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![task_id], entanglement_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every published entanglement, insertion order.
    pub fn all_entanglements(&self) -> Result<Vec<Entanglement>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTANGLEMENT_COLUMNS} FROM entanglements ORDER BY id"
        ))?;
        let rows = stmt.query_map([], entanglement_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Claims
    // -----------------------------------------------------------------------

    /// Claim a file for a task. Idempotent when the owner is unchanged;
    /// `AlreadyClaimed` when another task holds the path.
    pub fn claim(&self, filepath: &str, owner: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn();
        let changes = conn.execute(
            "INSERT OR IGNORE INTO claims (filepath, owner_task_id, claimed_at)
             VALUES (?1, ?2, ?3)",
            params![filepath, owner, &now],
        )?;
        if changes == 0 {
            let existing: String = conn.query_row(
                "SELECT owner_task_id FROM claims WHERE filepath = ?1",
                params![filepath],
                |row| row.get(0),
            )?;
            if existing != owner {
                return Err(TychoError::AlreadyClaimed {
                    path: filepath.to_string(),
                    owner: existing,
                });
            }
        }
        Ok(())
    }

    /// Release one claim; no-op if the pair does not match.
    pub fn release_one(&self, filepath: &str, owner: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM claims WHERE filepath = ?1 AND owner_task_id = ?2",
            params![filepath, owner],
        )?;
        Ok(())
    }

    /// Release every claim held by a task; no-op if it holds none.
    pub fn release_all(&self, owner: &str) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "DELETE FROM claims WHERE owner_task_id = ?1",
            params![owner],
        )?;
        Ok(())
    }

    /// The claim owner for a path, or `None` if unclaimed.
    pub fn owner(&self, filepath: &str) -> Result<Option<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT owner_task_id FROM claims WHERE filepath = ?1")?;
        match stmt.query_row(params![filepath], |row| row.get(0)) {
            Ok(owner) => Ok(Some(owner)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Paths claimed by a task, lexicographically sorted.
    pub fn claims_for(&self, owner: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT filepath FROM claims WHERE owner_task_id = ?1 ORDER BY filepath",
        )?;
        let rows = stmt.query_map(params![owner], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every claim as a path -> owner mapping.
    pub fn all_claims(&self) -> Result<BTreeMap<String, String>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT filepath, owner_task_id FROM claims ORDER BY filepath")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (path, owner): (String, String) = row?;
            out.insert(path, owner);
        }
        Ok(out)
    }

    /// Claim rows with timestamps, ordered by path. Feeds stale detection.
    pub fn claim_info(&self) -> Result<Vec<Claim>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT filepath, owner_task_id, claimed_at FROM claims ORDER BY filepath",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Claim {
                filepath: row.get(0)?,
                owner_task_id: row.get(1)?,
                claimed_at: parse_dt(&row.get::<_, String>(2)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Discoveries
    // -----------------------------------------------------------------------

    /// Insert a discovery; returns the assigned id (strictly increasing).
    pub fn post_discovery(&self, d: &Discovery) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO discoveries
                 (source_task_id, kind, detail, affected_task_id, resolved, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                d.source_task_id,
                d.kind.to_string(),
                d.detail,
                d.affected_task_id,
                &now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Discoveries sourced from or addressed to the task, insertion order.
    pub fn discoveries_for(&self, task_id: &str) -> Result<Vec<Discovery>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DISCOVERY_COLUMNS} FROM discoveries
             WHERE source_task_id = ?1 OR affected_task_id = ?1
             ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![task_id], discovery_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every discovery, insertion order.
    pub fn all_discoveries(&self) -> Result<Vec<Discovery>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DISCOVERY_COLUMNS} FROM discoveries ORDER BY id"
        ))?;
        let rows = stmt.query_map([], discovery_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Discoveries not yet resolved, insertion order.
    pub fn unresolved_discoveries(&self) -> Result<Vec<Discovery>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DISCOVERY_COLUMNS} FROM discoveries WHERE resolved = 0 ORDER BY id"
        ))?;
        let rows = stmt.query_map([], discovery_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Mark a discovery resolved. Resolution is monotonic; resolving twice
    /// is a no-op, resolving an unknown id is `DiscoveryNotFound`.
    pub fn resolve_discovery(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        let changes = conn.execute(
            "UPDATE discoveries SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        if changes == 0 {
            return Err(TychoError::DiscoveryNotFound(id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Working memory
    // -----------------------------------------------------------------------

    /// Append a working-memory entry for a task.
    pub fn add_memory(&self, entry: &MemoryEntry) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO memory (task_id, kind, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.task_id, entry.kind, entry.content, &now],
        )?;
        Ok(())
    }

    /// A task's memory entries, append order.
    pub fn memory_for(&self, task_id: &str) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, content, created_at FROM memory
             WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(MemoryEntry {
                task_id: row.get(0)?,
                kind: row.get(1)?,
                content: row.get(2)?,
                created_at: parse_dt(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Every memory entry, append order.
    pub fn all_memory(&self) -> Result<Vec<MemoryEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, content, created_at FROM memory ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MemoryEntry {
                task_id: row.get(0)?,
                kind: row.get(1)?,
                content: row.get(2)?,
                created_at: parse_dt(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
