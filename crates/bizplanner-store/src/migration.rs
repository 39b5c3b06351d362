//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number. Applied
//! versions are tracked in `_migrations`, so running them twice is a no-op.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "work items with lifecycle, estimate and embedding columns",
        sql: r#"
            CREATE TABLE work_items (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                context_id        INTEGER NOT NULL,
                title             TEXT NOT NULL CHECK(length(trim(title)) > 0),
                status            TEXT NOT NULL DEFAULT 'open'
                                  CHECK(status IN ('open','done','archived')),
                priority          INTEGER NOT NULL DEFAULT 2 CHECK(priority BETWEEN 1 AND 4),
                estimated_minutes INTEGER
                                  CHECK(estimated_minutes IS NULL OR estimated_minutes BETWEEN 1 AND 480),
                actual_minutes    INTEGER
                                  CHECK(actual_minutes IS NULL OR actual_minutes BETWEEN 1 AND 480),
                embedding         BLOB,
                deadline          TEXT,
                deadline_text     TEXT,
                assignee_name     TEXT,
                project           TEXT,
                requester_id      TEXT,
                created_at        INTEGER NOT NULL,
                completed_at      INTEGER,
                CHECK(status <> 'open' OR actual_minutes IS NULL),
                CHECK(status <> 'done' OR actual_minutes IS NOT NULL)
            );
            CREATE INDEX idx_work_items_context_status ON work_items(context_id, status);

            CREATE TRIGGER work_items_context_immutable
            BEFORE UPDATE OF context_id ON work_items
            WHEN NEW.context_id IS NOT OLD.context_id
            BEGIN
                SELECT RAISE(ABORT, 'context_id is immutable');
            END;
        "#,
    },
    Migration {
        version: 2,
        description: "index for the embedding backfill scan",
        sql: r#"
            CREATE INDEX idx_work_items_missing_embedding
                ON work_items(created_at) WHERE embedding IS NULL;
        "#,
    },
    Migration {
        version: 3,
        description: "failed embedding attempts, so the backfill can move past bad items",
        sql: r#"
            ALTER TABLE work_items ADD COLUMN embedding_attempts INTEGER NOT NULL DEFAULT 0;
            DROP INDEX idx_work_items_missing_embedding;
            CREATE INDEX idx_work_items_missing_embedding
                ON work_items(embedding_attempts, created_at) WHERE embedding IS NULL;
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// Synchronous; call it from `spawn_blocking` or [`crate::Database::execute`].
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })
}

/// Apply a single migration inside its own transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp()
            ],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────
