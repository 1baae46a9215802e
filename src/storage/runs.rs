//! Canonical run persistence.
//!
//! Every write goes through [`RunStore::upsert`], which serializes writers
//! of the same `(date, run_type)` behind an in-process lock and performs the
//! read-combine-write cycle inside one `IMMEDIATE` transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;

use super::{with_retry, Pool, StoreError};
use crate::ingest::reconcile;
use crate::runs::{BackupRun, Conflict, DateWindow, RunKey, RunSource, RunStatus, RunType};

pub const DEFAULT_PER_PAGE: u32 = 25;
pub const MAX_PER_PAGE: u32 = 200;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const COLUMNS: &str = "date, run_type, status, started_at, completed_at, duration_secs, \
     bytes_sent, bytes_received, total_size, exit_code, source, log_status, job, raw_excerpt";

const NEWEST_FIRST: &str = "ORDER BY date DESC, COALESCE(started_at, date) DESC, run_type ASC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct UpsertReport {
    pub outcome: UpsertOutcome,
    /// A tracking/log disagreement that this write introduced.
    pub conflict: Option<Conflict>,
    /// The record as stored after the write.
    pub run: BackupRun,
}

/// Filter and page for [`RunStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub run_type: Option<RunType>,
    pub status: Option<RunStatus>,
    /// Case-insensitive substring of the raw excerpt.
    pub search: Option<String>,
    /// 1-based.
    pub page: u32,
    pub per_page: u32,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            run_type: None,
            status: None,
            search: None,
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPage {
    pub runs: Vec<BackupRun>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<RunKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn for_key(&self, key: RunKey) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(key).or_default().clone()
    }
}

#[derive(Clone)]
pub struct RunStore {
    pool: Pool,
    locks: Arc<KeyLocks>,
}

impl RunStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyLocks::default()),
        }
    }

    /// Merge `run` into whatever is stored under its key.
    pub fn upsert(&self, run: BackupRun) -> Result<UpsertReport, StoreError> {
        let lock = self.locks.for_key(run.key());
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        with_retry(|| self.try_upsert(&run))
    }

    fn try_upsert(&self, run: &BackupRun) -> Result<UpsertReport, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = fetch(&tx, run.date, run.run_type)?;
        let merged = reconcile::combine(existing.as_ref(), run.clone());
        let conflict = reconcile::new_conflict(existing.as_ref(), &merged);
        let outcome = match &existing {
            Some(current) if *current == merged => UpsertOutcome::Unchanged,
            Some(_) => {
                write(&tx, &merged)?;
                UpsertOutcome::Updated
            }
            None => {
                write(&tx, &merged)?;
                UpsertOutcome::Inserted
            }
        };
        tx.commit()?;

        Ok(UpsertReport {
            outcome,
            conflict,
            run: merged,
        })
    }

    /// Withdraw the open record a log block left under `key` before it was
    /// retagged. Only a still-running log record started at `started_at` is
    /// touched: tracking data on it survives as a tracking-only record,
    /// otherwise the row is removed. Returns whether anything changed.
    pub fn retract_open(&self, key: RunKey, started_at: NaiveDateTime) -> Result<bool, StoreError> {
        let lock = self.locks.for_key(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        with_retry(|| self.try_retract_open(key, started_at))
    }

    fn try_retract_open(&self, key: RunKey, started_at: NaiveDateTime) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(current) = fetch(&tx, key.0, key.1)? else {
            return Ok(false);
        };
        let left_open_by_block = current.source.has_log()
            && current.log_status == Some(RunStatus::Running)
            && current.started_at == Some(started_at);
        if !left_open_by_block {
            return Ok(false);
        }

        if current.source.has_tracking() {
            let mut run = BackupRun::tracking_only(key.0, current.status);
            run.run_type = key.1;
            write(&tx, &run)?;
        } else {
            tx.execute(
                "DELETE FROM backup_runs WHERE date = ?1 AND run_type = ?2",
                params![key.0.format(DATE_FORMAT).to_string(), key.1.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn get(&self, date: NaiveDate, run_type: RunType) -> Result<Option<BackupRun>, StoreError> {
        let conn = self.pool.get()?;
        fetch(&conn, date, run_type)
    }

    pub fn list(&self, filter: &RunFilter) -> Result<RunPage, StoreError> {
        let page = filter.page.max(1);
        let per_page = filter.per_page.clamp(1, MAX_PER_PAGE);

        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(from) = filter.from {
            clauses.push("date >= ?");
            args.push(Box::new(from.format(DATE_FORMAT).to_string()));
        }
        if let Some(to) = filter.to {
            clauses.push("date <= ?");
            args.push(Box::new(to.format(DATE_FORMAT).to_string()));
        }
        if let Some(run_type) = filter.run_type {
            clauses.push("run_type = ?");
            args.push(Box::new(run_type.as_str()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            args.push(Box::new(status.as_str()));
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            clauses.push("raw_excerpt LIKE ? ESCAPE '\\'");
            args.push(Box::new(format!("%{}%", escape_like(search))));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.pool.get()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM backup_runs {where_sql}"),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let offset = i64::from(page - 1) * i64::from(per_page);
        args.push(Box::new(i64::from(per_page)));
        args.push(Box::new(offset));
        let runs = query_runs(
            &conn,
            &format!("SELECT {COLUMNS} FROM backup_runs {where_sql} {NEWEST_FIRST} LIMIT ? OFFSET ?"),
            rusqlite::params_from_iter(args.iter()),
        )?;

        let total = total.max(0) as u64;
        Ok(RunPage {
            runs,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(u64::from(per_page)) as u32,
        })
    }

    /// All records inside `window`, oldest first.
    pub fn in_window(&self, window: &DateWindow) -> Result<Vec<BackupRun>, StoreError> {
        let from = window.from.map(|d| d.format(DATE_FORMAT).to_string());
        let to = window.to.map(|d| d.format(DATE_FORMAT).to_string());
        let conn = self.pool.get()?;
        query_runs(
            &conn,
            &format!(
                "SELECT {COLUMNS} FROM backup_runs
                 WHERE (?1 IS NULL OR date >= ?1) AND (?2 IS NULL OR date <= ?2)
                 ORDER BY date ASC, COALESCE(started_at, date) ASC, run_type ASC"
            ),
            params![from, to],
        )
    }

    pub fn latest(&self) -> Result<Option<BackupRun>, StoreError> {
        let conn = self.pool.get()?;
        let mut runs = query_runs(
            &conn,
            &format!("SELECT {COLUMNS} FROM backup_runs {NEWEST_FIRST} LIMIT 1"),
            [],
        )?;
        Ok(runs.pop())
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM backup_runs", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Mark manual placeholders that never gained log evidence and are older
    /// than `max_age` as `unknown`. Returns how many were expired.
    pub fn expire_stale_placeholders(&self, now: NaiveDateTime, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = (now - max_age).format(DATETIME_FORMAT).to_string();
        with_retry(|| {
            let conn = self.pool.get()?;
            let changed = conn.execute(
                "UPDATE backup_runs
                 SET status = 'unknown', log_status = 'unknown', updated_at = datetime('now')
                 WHERE run_type = 'manual' AND status = 'running' AND raw_excerpt IS NULL
                   AND started_at IS NOT NULL AND started_at < ?1",
                params![cutoff],
            )?;
            Ok(changed)
        })
    }
}

fn fetch(conn: &Connection, date: NaiveDate, run_type: RunType) -> Result<Option<BackupRun>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM backup_runs WHERE date = ?1 AND run_type = ?2"),
            params![date.format(DATE_FORMAT).to_string(), run_type.as_str()],
            RunRow::read,
        )
        .optional()?;
    row.map(RunRow::into_run).transpose()
}

fn query_runs<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<BackupRun>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, RunRow::read)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RunRow::into_run).collect()
}

fn write(conn: &Connection, run: &BackupRun) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO backup_runs ({COLUMNS}, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, datetime('now'))
             ON CONFLICT(date, run_type) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                duration_secs = excluded.duration_secs,
                bytes_sent = excluded.bytes_sent,
                bytes_received = excluded.bytes_received,
                total_size = excluded.total_size,
                exit_code = excluded.exit_code,
                source = excluded.source,
                log_status = excluded.log_status,
                job = excluded.job,
                raw_excerpt = excluded.raw_excerpt,
                updated_at = excluded.updated_at"
        ),
        params![
            run.date.format(DATE_FORMAT).to_string(),
            run.run_type.as_str(),
            run.status.as_str(),
            run.started_at.map(|t| t.format(DATETIME_FORMAT).to_string()),
            run.completed_at.map(|t| t.format(DATETIME_FORMAT).to_string()),
            run.duration_secs,
            run.bytes_sent.map(|v| v as i64),
            run.bytes_received.map(|v| v as i64),
            run.total_size.map(|v| v as i64),
            run.exit_code,
            run.source.as_str(),
            run.log_status.map(|s| s.as_str()),
            run.job,
            run.raw_excerpt,
        ],
    )?;
    Ok(())
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Column values as stored, before conversion into domain types.
struct RunRow {
    date: String,
    run_type: String,
    status: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_secs: Option<i64>,
    bytes_sent: Option<i64>,
    bytes_received: Option<i64>,
    total_size: Option<i64>,
    exit_code: Option<i32>,
    source: String,
    log_status: Option<String>,
    job: Option<String>,
    raw_excerpt: Option<String>,
}

impl RunRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            date: row.get(0)?,
            run_type: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            duration_secs: row.get(5)?,
            bytes_sent: row.get(6)?,
            bytes_received: row.get(7)?,
            total_size: row.get(8)?,
            exit_code: row.get(9)?,
            source: row.get(10)?,
            log_status: row.get(11)?,
            job: row.get(12)?,
            raw_excerpt: row.get(13)?,
        })
    }

    fn into_run(self) -> Result<BackupRun, StoreError> {
        Ok(BackupRun {
            date: NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
                .map_err(|e| StoreError::Corrupt(format!("date '{}': {e}", self.date)))?,
            run_type: self.run_type.parse::<RunType>().map_err(corrupt)?,
            status: self.status.parse::<RunStatus>().map_err(corrupt)?,
            started_at: parse_datetime(self.started_at)?,
            completed_at: parse_datetime(self.completed_at)?,
            duration_secs: self.duration_secs,
            bytes_sent: self.bytes_sent.map(|v| v as u64),
            bytes_received: self.bytes_received.map(|v| v as u64),
            total_size: self.total_size.map(|v| v as u64),
            exit_code: self.exit_code,
            source: self.source.parse::<RunSource>().map_err(corrupt)?,
            log_status: self
                .log_status
                .map(|s| s.parse::<RunStatus>())
                .transpose()
                .map_err(corrupt)?,
            job: self.job,
            raw_excerpt: self.raw_excerpt,
        })
    }
}

fn parse_datetime(raw: Option<String>) -> Result<Option<NaiveDateTime>, StoreError> {
    raw.map(|s| {
        NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
    })
    .transpose()
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("runs.db")).unwrap();
        (dir, RunStore::new(pool))
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn log_run(day: &str, run_type: RunType, status: RunStatus, excerpt: &str) -> BackupRun {
        let started_at = date(day).and_hms_opt(3, 0, 0).unwrap();
        let mut run = BackupRun::manual_placeholder(started_at);
        run.run_type = run_type;
        run.status = status;
        run.log_status = Some(status);
        run.completed_at = status.is_terminal().then(|| started_at + Duration::seconds(600));
        run.total_size = Some(1_000);
        run.raw_excerpt = Some(excerpt.to_string());
        run.refresh_duration();
        run
    }

    #[test]
    fn test_upsert_insert_then_unchanged() {
        let (_dir, store) = store();
        let run = log_run("2026-02-20", RunType::DailyMirror, RunStatus::Success, "ok");

        let first = store.upsert(run.clone()).unwrap();
        assert_eq!(first.outcome, UpsertOutcome::Inserted);
        let second = store.upsert(run.clone()).unwrap();
        assert_eq!(second.outcome, UpsertOutcome::Unchanged);

        assert_eq!(store.get(run.date, run.run_type).unwrap(), Some(run));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_upsert_merges_tracking_and_reports_conflict_once() {
        let (_dir, store) = store();
        store
            .upsert(log_run("2026-02-22", RunType::DailyMirror, RunStatus::Success, "ok"))
            .unwrap();

        let tracking = BackupRun::tracking_only(date("2026-02-22"), RunStatus::Failed);
        let report = store.upsert(tracking.clone()).unwrap();
        assert_eq!(report.outcome, UpsertOutcome::Updated);
        assert_eq!(report.run.status, RunStatus::Failed);
        assert_eq!(report.run.source, RunSource::Merged);
        assert_eq!(report.run.total_size, Some(1_000));
        assert!(report.conflict.is_some());

        let again = store.upsert(tracking).unwrap();
        assert_eq!(again.outcome, UpsertOutcome::Unchanged);
        assert!(again.conflict.is_none());
    }

    #[test]
    fn test_list_filters_and_paginates_newest_first() {
        let (_dir, store) = store();
        for day in 1..=9 {
            let d = format!("2026-02-0{day}");
            store
                .upsert(log_run(&d, RunType::DailyMirror, RunStatus::Success, "rsync 100%"))
                .unwrap();
        }
        store
            .upsert(log_run("2026-02-08", RunType::Snapshot, RunStatus::Failed, "disk_full 50%_used"))
            .unwrap();

        let page = store
            .list(&RunFilter {
                per_page: 4,
                page: 2,
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(page.total, 10);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.runs.len(), 4);
        assert!(page.runs.windows(2).all(|w| w[0].date >= w[1].date));

        let failed = store
            .list(&RunFilter {
                status: Some(RunStatus::Failed),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.runs[0].run_type, RunType::Snapshot);

        let searched = store
            .list(&RunFilter {
                search: Some("DISK_FULL".to_string()),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(searched.total, 1);

        let literal_percent = store
            .list(&RunFilter {
                search: Some("50%_".to_string()),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(literal_percent.total, 1);

        let ranged = store
            .list(&RunFilter {
                from: Some(date("2026-02-03")),
                to: Some(date("2026-02-05")),
                run_type: Some(RunType::DailyMirror),
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(ranged.total, 3);
    }

    #[test]
    fn test_per_page_is_capped() {
        let (_dir, store) = store();
        let page = store
            .list(&RunFilter {
                per_page: 10_000,
                page: 0,
                ..RunFilter::default()
            })
            .unwrap();
        assert_eq!(page.per_page, MAX_PER_PAGE);
        assert_eq!(page.page, 1);
        assert_eq!(page.total_pages, 0);
    }

    #[test]
    fn test_in_window_and_latest() {
        let (_dir, store) = store();
        store
            .upsert(log_run("2026-02-20", RunType::DailyMirror, RunStatus::Success, "a"))
            .unwrap();
        store
            .upsert(log_run("2026-02-22", RunType::Cleanup, RunStatus::Success, "b"))
            .unwrap();

        let window = DateWindow {
            from: Some(date("2026-02-21")),
            to: None,
        };
        let runs = store.in_window(&window).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_type, RunType::Cleanup);
        assert_eq!(store.in_window(&DateWindow::ALL).unwrap().len(), 2);
        assert_eq!(store.latest().unwrap().unwrap().date, date("2026-02-22"));
    }

    #[test]
    fn test_expire_stale_placeholders() {
        let (_dir, store) = store();
        let started = date("2026-02-23").and_hms_opt(10, 0, 0).unwrap();
        store.upsert(BackupRun::manual_placeholder(started)).unwrap();

        let expired = store
            .expire_stale_placeholders(started + Duration::hours(1), Duration::hours(6))
            .unwrap();
        assert_eq!(expired, 0);

        let expired = store
            .expire_stale_placeholders(started + Duration::hours(7), Duration::hours(6))
            .unwrap();
        assert_eq!(expired, 1);
        let run = store.get(started.date(), RunType::Manual).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
    }

    #[test]
    fn test_retract_open_only_touches_the_matching_running_record() {
        let (_dir, store) = store();
        let open = log_run("2026-03-02", RunType::DailyMirror, RunStatus::Running, "started");
        let started = open.started_at.unwrap();
        store.upsert(open.clone()).unwrap();

        let key = (open.date, RunType::DailyMirror);
        assert!(!store.retract_open(key, started + Duration::seconds(1)).unwrap());
        assert!(store.retract_open(key, started).unwrap());
        assert_eq!(store.get(open.date, RunType::DailyMirror).unwrap(), None);
        assert!(!store.retract_open(key, started).unwrap());

        let closed = log_run("2026-03-03", RunType::DailyMirror, RunStatus::Success, "done");
        store.upsert(closed.clone()).unwrap();
        let key = (closed.date, RunType::DailyMirror);
        assert!(!store.retract_open(key, closed.started_at.unwrap()).unwrap());
        assert_eq!(store.get(closed.date, RunType::DailyMirror).unwrap(), Some(closed));
    }

    #[test]
    fn test_retract_open_keeps_tracking_status() {
        let (_dir, store) = store();
        let open = log_run("2026-03-02", RunType::DailyMirror, RunStatus::Running, "started");
        store.upsert(open.clone()).unwrap();
        store
            .upsert(BackupRun::tracking_only(open.date, RunStatus::Success))
            .unwrap();

        assert!(store
            .retract_open((open.date, RunType::DailyMirror), open.started_at.unwrap())
            .unwrap());
        assert_eq!(
            store.get(open.date, RunType::DailyMirror).unwrap(),
            Some(BackupRun::tracking_only(open.date, RunStatus::Success))
        );
    }

    #[test]
    fn test_concurrent_upserts_same_key_keep_one_row() {
        let (_dir, store) = store();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let status = if i % 2 == 0 { RunStatus::Success } else { RunStatus::Failed };
                    store
                        .upsert(BackupRun::tracking_only(date("2026-02-20"), status))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.count().unwrap(), 1);
    }
}
