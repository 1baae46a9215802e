//! Summary statistics over a window of run records.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::runs::{BackupRun, DateWindow, RunStatus, RunType};

/// Largest size recorded on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailySize {
    pub date: NaiveDate,
    pub total_size: u64,
}

/// The most recent run that is no longer in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastBackup {
    pub date: NaiveDate,
    pub run_type: RunType,
    pub status: RunStatus,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub window: DateWindow,
    /// Percent of known outcomes that succeeded, one decimal.
    pub success_rate: f64,
    pub total_backups: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub daily_sizes: Vec<DailySize>,
    pub type_counts: BTreeMap<RunType, u64>,
    pub latest_size: Option<u64>,
    pub avg_duration_secs: Option<f64>,
    pub last_backup: Option<LastBackup>,
}

/// Pure computation; callers fetch the runs.
pub struct MetricsAggregator;

impl MetricsAggregator {
    pub fn compute(runs: &[BackupRun], window: DateWindow) -> Metrics {
        let in_range: Vec<&BackupRun> = runs.iter().filter(|r| window.contains(r.date)).collect();

        let success_count = count_status(&in_range, RunStatus::Success);
        let failure_count = count_status(&in_range, RunStatus::Failed);
        let known = success_count + failure_count;
        let success_rate = if known == 0 {
            0.0
        } else {
            round1(success_count as f64 * 100.0 / known as f64)
        };

        let mut type_counts: BTreeMap<RunType, u64> = RunType::ALL.into_iter().map(|t| (t, 0)).collect();
        let mut daily: BTreeMap<NaiveDate, u64> = BTreeMap::new();
        for run in &in_range {
            *type_counts.entry(run.run_type).or_default() += 1;
            if let Some(size) = run.total_size {
                let slot = daily.entry(run.date).or_default();
                *slot = (*slot).max(size);
            }
        }

        let latest_size = in_range
            .iter()
            .filter(|r| r.status == RunStatus::Success && r.total_size.is_some())
            .max_by_key(|r| recency(r))
            .and_then(|r| r.total_size);

        let durations: Vec<i64> = in_range
            .iter()
            .filter(|r| r.status == RunStatus::Success)
            .filter_map(|r| r.duration_secs)
            .collect();
        let avg_duration_secs = (!durations.is_empty())
            .then(|| round1(durations.iter().sum::<i64>() as f64 / durations.len() as f64));

        let last_backup = in_range
            .iter()
            .filter(|r| r.status != RunStatus::Running)
            .max_by_key(|r| recency(r))
            .map(|r| LastBackup {
                date: r.date,
                run_type: r.run_type,
                status: r.status,
                completed_at: r.completed_at,
            });

        Metrics {
            window,
            success_rate,
            total_backups: in_range.len() as u64,
            success_count,
            failure_count,
            daily_sizes: daily
                .into_iter()
                .map(|(date, total_size)| DailySize { date, total_size })
                .collect(),
            type_counts,
            latest_size,
            avg_duration_secs,
            last_backup,
        }
    }
}

fn count_status(runs: &[&BackupRun], status: RunStatus) -> u64 {
    runs.iter().filter(|r| r.status == status).count() as u64
}

fn recency(run: &BackupRun) -> (NaiveDate, Option<NaiveDateTime>) {
    (run.date, run.completed_at.or(run.started_at))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
