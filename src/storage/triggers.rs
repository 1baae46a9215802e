//! Last admitted manual trigger, shared by every process on the database.

use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{with_retry, Pool, StoreError};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Outcome of [`TriggerLedger::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDecision {
    /// `now` is recorded; `previous` is what it replaced.
    Admitted { previous: Option<NaiveDateTime> },
    /// The trigger recorded at `last` is still inside the cooldown.
    Refused { last: NaiveDateTime },
}

#[derive(Clone)]
pub struct TriggerLedger {
    pool: Pool,
}

impl TriggerLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn last(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        let conn = self.pool.get()?;
        read_last(&conn)
    }

    /// Check the cooldown against the recorded trigger and record `now`,
    /// inside one `IMMEDIATE` transaction.
    pub fn try_admit(&self, now: NaiveDateTime, cooldown: Duration) -> Result<LedgerDecision, StoreError> {
        with_retry(|| {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let last = read_last(&tx)?;
            if let Some(last) = last.filter(|last| now - *last < cooldown) {
                return Ok(LedgerDecision::Refused { last });
            }
            write_last(&tx, Some(now))?;
            tx.commit()?;
            Ok(LedgerDecision::Admitted { previous: last })
        })
    }

    /// Put `previous` back, unless a later admission replaced `granted_at`.
    pub fn restore(&self, granted_at: NaiveDateTime, previous: Option<NaiveDateTime>) -> Result<bool, StoreError> {
        with_retry(|| {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if read_last(&tx)? != Some(granted_at) {
                return Ok(false);
            }
            write_last(&tx, previous)?;
            tx.commit()?;
            Ok(true)
        })
    }
}

fn read_last(conn: &Connection) -> Result<Option<NaiveDateTime>, StoreError> {
    let raw: Option<String> = conn
        .query_row("SELECT last_trigger FROM trigger_ledger WHERE id = 1", [], |row| row.get(0))
        .optional()?;
    raw.map(|s| {
        NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("last_trigger '{s}': {e}")))
    })
    .transpose()
}

fn write_last(conn: &Connection, last: Option<NaiveDateTime>) -> Result<(), StoreError> {
    match last {
        Some(at) => conn.execute(
            "INSERT INTO trigger_ledger (id, last_trigger, updated_at)
             VALUES (1, ?1, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                last_trigger = excluded.last_trigger,
                updated_at = excluded.updated_at",
            params![at.format(TIMESTAMP_FORMAT).to_string()],
        )?,
        None => conn.execute("DELETE FROM trigger_ledger WHERE id = 1", [])?,
    };
    Ok(())
}
