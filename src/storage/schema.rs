//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS backup_runs (
            date TEXT NOT NULL,
            run_type TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            duration_secs INTEGER,
            bytes_sent INTEGER,
            bytes_received INTEGER,
            total_size INTEGER,
            exit_code INTEGER,
            source TEXT NOT NULL,
            log_status TEXT,
            job TEXT,
            raw_excerpt TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (date, run_type)
        );

        CREATE TABLE IF NOT EXISTS cursors (
            path TEXT PRIMARY KEY,
            byte_offset INTEGER NOT NULL,
            device INTEGER NOT NULL DEFAULT 0,
            inode INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS ingest_diagnostics (
            id INTEGER PRIMARY KEY,
            severity TEXT NOT NULL,
            kind TEXT NOT NULL,
            source TEXT NOT NULL,
            message TEXT NOT NULL,
            detail_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS trigger_ledger (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_trigger TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_backup_runs_status ON backup_runs(status);
        CREATE INDEX IF NOT EXISTS idx_backup_runs_type ON backup_runs(run_type);
        CREATE INDEX IF NOT EXISTS idx_ingest_diagnostics_created ON ingest_diagnostics(created_at);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        INSERT OR IGNORE INTO schema_version (version) VALUES (2);",
    )?;

    Ok(())
}
