use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Open (or create) the database at `path` and initialise the schema.
///
/// Enables WAL so readers never block the claiming writer, turns on foreign
/// keys for the documents cascade, and sets a busy timeout so concurrent
/// claimers from other processes wait for the write lock instead of failing.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    init_db(&conn)?;
    Ok(conn)
}

/// In-memory database with the schema applied. Used by tests and dry runs.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Initialise the queue schema in `conn`.
///
/// Creates the `jobs` and `documents` tables (idempotent). The claim index
/// matches the `ORDER BY priority DESC, created_at ASC` of the pending-jobs
/// query so claiming stays an index scan.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT    NOT NULL PRIMARY KEY,
            job_type      TEXT    NOT NULL,
            status        TEXT    NOT NULL DEFAULT 'pending',
            priority      INTEGER NOT NULL DEFAULT 50,
            url           TEXT    NOT NULL DEFAULT '',
            input         TEXT    NOT NULL DEFAULT 'null',  -- opaque JSON payload
            error         TEXT,
            claimed_by    TEXT,                             -- worker id holding the claim
            claimed_at    TEXT,
            created_at    TEXT    NOT NULL,                 -- RFC 3339, fixed precision
            updated_at    TEXT    NOT NULL,
            completed_at  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs (status, priority DESC, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_type_created
            ON jobs (job_type, created_at);

        CREATE TABLE IF NOT EXISTS documents (
            id          TEXT NOT NULL PRIMARY KEY,
            job_id      TEXT REFERENCES jobs (id) ON DELETE CASCADE,
            url         TEXT NOT NULL DEFAULT '',
            content     TEXT NOT NULL DEFAULT '',
            created_at  TEXT NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_documents_created ON documents (created_at);
        CREATE INDEX IF NOT EXISTS idx_documents_job ON documents (job_id);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('jobs', 'documents')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
