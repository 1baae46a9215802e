//! Merging log fragments with tracking feed authority.
//!
//! [`combine`] is the single precedence rule. [`merge`] folds one cycle's
//! inputs with it, and the store applies it again against what is already
//! persisted, so a record ends up the same whichever cycle delivered each
//! half.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::parser::ParsedRun;
use crate::runs::{BackupRun, Conflict, RunKey, RunSource, RunStatus};

impl From<ParsedRun> for BackupRun {
    fn from(parsed: ParsedRun) -> Self {
        let status = parsed.status.unwrap_or(RunStatus::Running);
        let mut run = BackupRun {
            date: parsed.date(),
            run_type: parsed.run_type,
            status,
            started_at: Some(parsed.started_at),
            completed_at: parsed.completed_at,
            duration_secs: None,
            bytes_sent: parsed.bytes_sent,
            bytes_received: parsed.bytes_received,
            total_size: parsed.total_size,
            exit_code: parsed.exit_code,
            source: RunSource::LogOnly,
            log_status: Some(status),
            job: (!parsed.job.is_empty()).then_some(parsed.job),
            raw_excerpt: Some(parsed.raw_excerpt),
        };
        run.refresh_duration();
        run
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// At most one record per key, ordered by key.
    pub runs: Vec<BackupRun>,
    pub conflicts: Vec<Conflict>,
}

/// Fold a cycle's log fragments (in file order) and tracking entries into
/// candidate records.
pub fn merge(parsed: Vec<ParsedRun>, tracking: &BTreeMap<NaiveDate, RunStatus>) -> MergeOutcome {
    let mut folded: BTreeMap<RunKey, BackupRun> = BTreeMap::new();
    let incoming = parsed
        .into_iter()
        .map(BackupRun::from)
        .chain(tracking.iter().map(|(date, status)| BackupRun::tracking_only(*date, *status)));
    for run in incoming {
        let key = run.key();
        let next = combine(folded.get(&key), run);
        folded.insert(key, next);
    }

    let runs: Vec<BackupRun> = folded.into_values().collect();
    let conflicts = runs.iter().filter_map(BackupRun::conflict).collect();
    MergeOutcome { runs, conflicts }
}

/// Apply `incoming` on top of `existing`.
///
/// Tracking status beats log status. Log detail is taken wholesale from an
/// incoming log fragment unless that would replace a terminal log outcome
/// with a non-terminal one. A tracking-only record never touches log detail.
pub fn combine(existing: Option<&BackupRun>, incoming: BackupRun) -> BackupRun {
    let Some(existing) = existing else {
        return incoming;
    };

    let tracking_status = if incoming.source.has_tracking() {
        Some(incoming.status)
    } else if existing.source.has_tracking() {
        Some(existing.status)
    } else {
        None
    };

    let mut out = existing.clone();
    if incoming.source.has_log() && !regresses(existing.log_status, incoming.log_status) {
        out.started_at = incoming.started_at;
        out.completed_at = incoming.completed_at;
        out.duration_secs = incoming.duration_secs;
        out.bytes_sent = incoming.bytes_sent;
        out.bytes_received = incoming.bytes_received;
        out.total_size = incoming.total_size;
        out.exit_code = incoming.exit_code;
        out.log_status = incoming.log_status;
        out.job = incoming.job;
        out.raw_excerpt = incoming.raw_excerpt;
    }
    out.source = existing.source.union(incoming.source);
    out.status = tracking_status
        .or(out.log_status)
        .unwrap_or(RunStatus::Unknown);
    out
}

/// A disagreement present on `merged` that `existing` did not already carry.
pub fn new_conflict(existing: Option<&BackupRun>, merged: &BackupRun) -> Option<Conflict> {
    let conflict = merged.conflict()?;
    match existing.and_then(BackupRun::conflict) {
        Some(previous) if previous == conflict => None,
        _ => Some(conflict),
    }
}

fn regresses(existing: Option<RunStatus>, incoming: Option<RunStatus>) -> bool {
    let settled = existing.is_some_and(|s| s.is_terminal());
    let unsettled = !incoming.is_some_and(|s| s.is_terminal());
    settled && unsettled
}
