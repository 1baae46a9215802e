//! SQLite storage layer -- pool, schema, run records, cursors, journal,
//! trigger ledger.

pub mod cursors;
pub mod diagnostics;
pub mod runs;
pub mod schema;
pub mod triggers;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;
use thiserror::Error;
use tracing::debug;

pub use cursors::CursorStore;
pub use diagnostics::{Diagnostic, DiagnosticLog, Severity};
pub use runs::{RunFilter, RunPage, RunStore, UpsertOutcome, UpsertReport, DEFAULT_PER_PAGE, MAX_PER_PAGE};
pub use triggers::{LedgerDecision, TriggerLedger};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database still busy after {attempts} attempts")]
    Contention { attempts: u32 },
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

impl StoreError {
    fn is_busy(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Run `op`, retrying SQLITE_BUSY/LOCKED with doubling backoff.
pub(crate) fn with_retry<T>(mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match op() {
            Err(err) if err.is_busy() => {
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "database busy; retrying");
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            other => return other,
        }
    }
    Err(StoreError::Contention {
        attempts: MAX_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_BUSY),
            None,
        ))
    }

    #[test]
    fn test_retry_recovers_from_transient_busy() {
        let mut calls = 0;
        let result = with_retry(|| {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_gives_up_with_contention() {
        let mut calls = 0;
        let result: Result<(), StoreError> = with_retry(|| {
            calls += 1;
            Err(busy())
        });
        assert!(matches!(result, Err(StoreError::Contention { attempts: 5 })));
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), StoreError> = with_retry(|| {
            calls += 1;
            Err(StoreError::Corrupt("bad".into()))
        });
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_open_pool_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/state/replexon.db");
        let pool = open_pool(&path).unwrap();
        assert!(path.exists());
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM backup_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
