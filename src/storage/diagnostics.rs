//! Journal of ingestion anomalies and reconciliation conflicts.

use chrono::NaiveDateTime;
use rusqlite::params;
use serde::Serialize;

use super::{Pool, StoreError};
use crate::ingest::Anomaly;
use crate::runs::Conflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub id: i64,
    pub severity: Severity,
    pub kind: String,
    /// File or component the entry concerns.
    pub source: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
    /// UTC.
    pub created_at: NaiveDateTime,
}

#[derive(Clone)]
pub struct DiagnosticLog {
    pool: Pool,
}

impl DiagnosticLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(
        &self,
        severity: Severity,
        kind: &str,
        source: &str,
        message: &str,
        detail: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let detail_json = detail.map(|d| d.to_string());
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ingest_diagnostics (severity, kind, source, message, detail_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))",
            params![severity.as_str(), kind, source, message, detail_json],
        )?;
        Ok(())
    }

    pub fn record_anomaly(&self, source: &str, anomaly: &Anomaly) -> Result<(), StoreError> {
        let detail = serde_json::to_value(anomaly).ok();
        self.record(
            Severity::Warning,
            anomaly.kind(),
            source,
            &anomaly.to_string(),
            detail.as_ref(),
        )
    }

    pub fn record_conflict(&self, conflict: &Conflict) -> Result<(), StoreError> {
        let detail = serde_json::to_value(conflict).ok();
        self.record(
            Severity::Info,
            "reconciliation_conflict",
            "reconciler",
            &conflict.to_string(),
            detail.as_ref(),
        )
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Diagnostic>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, severity, kind, source, message, detail_json, created_at
             FROM ingest_diagnostics ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, severity, kind, source, message, detail, created_at)| {
                Ok(Diagnostic {
                    id,
                    severity: Severity::from_db(&severity),
                    kind,
                    source,
                    message,
                    detail: detail.and_then(|d| serde_json::from_str(&d).ok()),
                    created_at: NaiveDateTime::parse_from_str(&created_at, "%Y-%m-%d %H:%M:%S")
                        .map_err(|e| StoreError::Corrupt(format!("created_at '{created_at}': {e}")))?,
                })
            })
            .collect()
    }
}
