//! SQLite connection handles shared by every store in the process.
//!
//! The [`Database`] struct owns one read-write `rusqlite::Connection`
//! behind an `Arc<Mutex<>>` plus, for file-backed databases, a few
//! read-only connections. Writes go through [`Database::execute`]; scans
//! that only read go through [`Database::execute_read`] and, thanks to
//! WAL, run while a write on the main connection is in progress. Both hop
//! onto the blocking pool so a slow statement never stalls other runs.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Read-only connections opened next to the writer of a database file.
const READER_CONNECTIONS: usize = 4;

/// Thread-safe, cheaply cloneable handle to the planner database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    readers: Arc<ReaderPool>,
}

/// Round-robin set of read-only connections. Empty for in-memory
/// databases, whose connections cannot share data.
#[derive(Default)]
struct ReaderPool {
    conns: Vec<Arc<Mutex<Connection>>>,
    next: AtomicUsize,
}

impl ReaderPool {
    fn pick(&self) -> Option<Arc<Mutex<Connection>>> {
        if self.conns.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        Some(Arc::clone(&self.conns[idx]))
    }
}

impl Database {
    /// Open (or create) a database file at `path` and apply pragmas.
    ///
    /// Blocks on file I/O; call it during startup or from `spawn_blocking`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conns = (0..READER_CONNECTIONS)
            .map(|_| -> StoreResult<Arc<Mutex<Connection>>> {
                let reader = Connection::open_with_flags(path, flags)?;
                reader.pragma_update(None, "busy_timeout", 5_000_i32)?;
                Ok(Arc::new(Mutex::new(reader)))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        debug!(readers = conns.len(), "read-only connections opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            readers: Arc::new(ReaderPool {
                conns,
                next: AtomicUsize::new(0),
            }),
        })
    }

    /// Create an in-memory database. Used by tests and dry runs.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            readers: Arc::default(),
        })
    }

    /// Open the database file and bring its schema up to date.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database with the full schema applied.
    pub async fn open_in_memory_and_migrate() -> StoreResult<Self> {
        let db = Self::open_in_memory()?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(migration::run_all).await
    }

    /// Run a closure against the read-write connection on the blocking pool.
    ///
    /// Everything inside one closure runs while the connection mutex is
    /// held, so a read followed by a conditional write in the same closure
    /// cannot interleave with another caller's statements.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        run_locked(Arc::clone(&self.conn), f).await
    }

    /// Run a read-only closure on one of the reader connections.
    ///
    /// Falls back to the read-write connection for in-memory databases.
    /// Writes attempted here fail with `SQLITE_READONLY`.
    pub async fn execute_read<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.readers.pick().unwrap_or_else(|| Arc::clone(&self.conn));
        run_locked(conn, f).await
    }

    // ── pragmas ──────────────────────────────────────────────────────

    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite pragmas");

        // WAL lets the read-only connections proceed while a write commits.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        Ok(())
    }
}

async fn run_locked<F, T>(conn: Arc<Mutex<Connection>>, f: F) -> StoreResult<T>
where
    F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = conn
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
        f(&conn)
    })
    .await?
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .execute(|conn| {
                let v: String =
                    conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn migrations_create_work_items() {
        let db = Database::open_in_memory_and_migrate().await.unwrap();

        let count: i64 = db
            .execute(|conn| {
                let c: i64 =
                    conn.query_row("SELECT count(*) FROM work_items", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn readers_see_committed_writes_and_refuse_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_and_migrate(dir.path().join("planner.db"))
            .await
            .unwrap();

        db.execute(|conn| {
            conn.execute(
                "INSERT INTO work_items (context_id, title, created_at) VALUES (1, 'a', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        for _ in 0..READER_CONNECTIONS {
            let count: i64 = db
                .execute_read(|conn| {
                    Ok(conn.query_row("SELECT count(*) FROM work_items", [], |row| row.get(0))?)
                })
                .await
                .unwrap();
            assert_eq!(count, 1);
        }

        let write = db
            .execute_read(|conn| {
                conn.execute("DELETE FROM work_items", [])?;
                Ok(())
            })
            .await;
        assert!(write.is_err());
    }
}
