//! Canonical backup run records.
//!
//! A [`BackupRun`] is the merged view of one job execution, keyed by
//! calendar date and [`RunType`]. Log blocks contribute timing, transfer
//! statistics and an excerpt; the tracking feed contributes the
//! authoritative pass/fail status for the daily mirror job.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseVariantError {
    kind: &'static str,
    value: String,
}

/// Which backup job a run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    DailyMirror,
    Snapshot,
    Cleanup,
    Manual,
    ScriptBackup,
}

impl RunType {
    pub const ALL: [RunType; 5] = [
        RunType::DailyMirror,
        RunType::Snapshot,
        RunType::Cleanup,
        RunType::Manual,
        RunType::ScriptBackup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::DailyMirror => "daily_mirror",
            RunType::Snapshot => "snapshot",
            RunType::Cleanup => "cleanup",
            RunType::Manual => "manual",
            RunType::ScriptBackup => "script_backup",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseVariantError {
                kind: "run type",
                value: s.to_string(),
            })
    }
}

/// Outcome of a run as far as the engine knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    Running,
    Unknown,
}

impl RunStatus {
    /// Success and failure can only come from a closing marker or the
    /// tracking feed; they are never inferred from missing data.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Running => "running",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "running" => Ok(RunStatus::Running),
            "unknown" => Ok(RunStatus::Unknown),
            other => Err(ParseVariantError {
                kind: "run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Which inputs contributed to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    TrackingOnly,
    LogOnly,
    Merged,
}

impl RunSource {
    pub fn has_log(&self) -> bool {
        matches!(self, RunSource::LogOnly | RunSource::Merged)
    }

    pub fn has_tracking(&self) -> bool {
        matches!(self, RunSource::TrackingOnly | RunSource::Merged)
    }

    pub fn union(self, other: RunSource) -> RunSource {
        let log = self.has_log() || other.has_log();
        let tracking = self.has_tracking() || other.has_tracking();
        match (log, tracking) {
            (true, true) => RunSource::Merged,
            (false, true) => RunSource::TrackingOnly,
            _ => RunSource::LogOnly,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::TrackingOnly => "tracking_only",
            RunSource::LogOnly => "log_only",
            RunSource::Merged => "merged",
        }
    }
}

impl fmt::Display for RunSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RunSource {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tracking_only" => Ok(RunSource::TrackingOnly),
            "log_only" => Ok(RunSource::LogOnly),
            "merged" => Ok(RunSource::Merged),
            other => Err(ParseVariantError {
                kind: "run source",
                value: other.to_string(),
            }),
        }
    }
}

/// Identity of a canonical record.
pub type RunKey = (NaiveDate, RunType);

/// Tracking feed and log disagree on the outcome of the same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub date: NaiveDate,
    pub run_type: RunType,
    pub tracking: RunStatus,
    pub log: RunStatus,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: tracking feed says {}, log says {}",
            self.date, self.run_type, self.tracking, self.log
        )
    }
}

/// A canonical backup run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub date: NaiveDate,
    pub run_type: RunType,
    pub status: RunStatus,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub duration_secs: Option<i64>,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
    pub total_size: Option<u64>,
    pub exit_code: Option<i32>,
    pub source: RunSource,
    /// Status implied by the log block alone; `None` for tracking-only records.
    pub log_status: Option<RunStatus>,
    pub job: Option<String>,
    pub raw_excerpt: Option<String>,
}

impl BackupRun {
    /// A daily mirror record known only from the tracking feed.
    pub fn tracking_only(date: NaiveDate, status: RunStatus) -> Self {
        Self {
            date,
            run_type: RunType::DailyMirror,
            status,
            started_at: None,
            completed_at: None,
            duration_secs: None,
            bytes_sent: None,
            bytes_received: None,
            total_size: None,
            exit_code: None,
            source: RunSource::TrackingOnly,
            log_status: None,
            job: None,
            raw_excerpt: None,
        }
    }

    /// The `running` record inserted when an operator launches a backup.
    pub fn manual_placeholder(started_at: NaiveDateTime) -> Self {
        // stored with second precision
        let started_at = started_at.with_nanosecond(0).unwrap_or(started_at);
        Self {
            date: started_at.date(),
            run_type: RunType::Manual,
            status: RunStatus::Running,
            started_at: Some(started_at),
            completed_at: None,
            duration_secs: None,
            bytes_sent: None,
            bytes_received: None,
            total_size: None,
            exit_code: None,
            source: RunSource::LogOnly,
            log_status: Some(RunStatus::Running),
            job: None,
            raw_excerpt: None,
        }
    }

    pub fn key(&self) -> RunKey {
        (self.date, self.run_type)
    }

    /// Recompute `duration_secs` from the two endpoints.
    pub fn refresh_duration(&mut self) {
        self.duration_secs = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        };
    }

    /// Tracking status and terminal log status disagree.
    pub fn conflict(&self) -> Option<Conflict> {
        if !self.source.has_tracking() {
            return None;
        }
        let log = self.log_status.filter(RunStatus::is_terminal)?;
        (log != self.status).then(|| Conflict {
            date: self.date,
            run_type: self.run_type,
            tracking: self.status,
            log,
        })
    }

    pub fn duration_display(&self) -> String {
        let Some(total) = self.duration_secs else {
            return "-".to_string();
        };
        if total < 60 {
            return format!("{total}s");
        }
        let (minutes, seconds) = (total / 60, total % 60);
        if minutes < 60 {
            return format!("{minutes}m {seconds}s");
        }
        let (hours, minutes) = (minutes / 60, minutes % 60);
        format!("{hours}h {minutes}m {seconds}s")
    }

    pub fn size_display(&self) -> String {
        self.total_size.map(format_bytes).unwrap_or_else(|| "-".to_string())
    }

    pub fn transferred_display(&self) -> String {
        self.bytes_sent.map(format_bytes).unwrap_or_else(|| "-".to_string())
    }
}

/// Inclusive calendar range; an open end is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateWindow {
    pub const ALL: DateWindow = DateWindow { from: None, to: None };

    /// The `days` calendar days ending at `today`. A span reaching past the
    /// earliest representable date starts there.
    pub fn last_days(today: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        let from = today
            .checked_sub_signed(chrono::Duration::days(span))
            .unwrap_or(NaiveDate::MIN);
        Self {
            from: Some(from),
            to: Some(today),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

/// Binary-unit rendering with one decimal, e.g. `7.5 GB`.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    for unit in ["KB", "MB", "GB", "TB"] {
        value /= 1024.0;
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
    }
    format!("{:.1} PB", value / 1024.0)
}
