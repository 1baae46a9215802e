use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Local};
use cron::Schedule as CronSchedule;
use serde::Serialize;

use super::Schedule;
use crate::runs::RunType;

/// One upcoming fire time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpcomingRun {
    pub at: DateTime<Local>,
    pub name: String,
    pub job: RunType,
}

/// Validated, enabled schedules ready for previewing.
#[derive(Debug, Clone)]
pub struct ScheduleBook {
    entries: Vec<(Schedule, CronSchedule)>,
}

impl ScheduleBook {
    pub fn new(schedules: &[Schedule]) -> Result<Self> {
        let entries = schedules
            .iter()
            .filter(|s| s.enabled)
            .map(|s| {
                let parsed = CronSchedule::from_str(&s.cron_expr)
                    .map_err(|e| anyhow!("Invalid cron expression '{}': {}", s.cron_expr, e))?;
                Ok((s.clone(), parsed))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Schedule> {
        self.entries.iter().map(|(s, _)| s)
    }

    /// Fire times in `(from, from + hours]`, sorted by time.
    pub fn preview(&self, from: DateTime<Local>, hours: u64) -> Vec<UpcomingRun> {
        let end = from + Duration::hours(hours.min(24 * 366) as i64);
        let mut preview: Vec<UpcomingRun> = self
            .entries
            .iter()
            .flat_map(|(schedule, cron)| {
                cron.after(&from)
                    .take_while(move |at| *at <= end)
                    .map(move |at| UpcomingRun {
                        at,
                        name: schedule.name.clone(),
                        job: schedule.job,
                    })
            })
            .collect();

        // Sort by time
        preview.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.name.cmp(&b.name)));
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::profiles;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn friday_midnight() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 2, 20, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn test_preview_default_week() {
        let book = ScheduleBook::new(&profiles::defaults()).unwrap();
        let preview = book.preview(friday_midnight(), 7 * 24);

        let daily = preview.iter().filter(|r| r.job == RunType::DailyMirror).count();
        assert_eq!(daily, 7);

        let cleanup: Vec<_> = preview.iter().filter(|r| r.job == RunType::Cleanup).collect();
        assert_eq!(cleanup.len(), 1);
        assert_eq!(cleanup[0].at.weekday(), Weekday::Sun);
        assert_eq!(cleanup[0].at.hour(), 4);

        assert!(preview.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn test_monthly_job_fires_on_the_first() {
        let book = ScheduleBook::new(&profiles::defaults()).unwrap();
        let preview = book.preview(friday_midnight(), 10 * 24);
        let monthly: Vec<_> = preview.iter().filter(|r| r.job == RunType::ScriptBackup).collect();
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].at.day(), 1);
        assert_eq!(monthly[0].at.month(), 3);
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let mut schedules = profiles::defaults();
        schedules[0].cron_expr = "not a cron".to_string();
        assert!(ScheduleBook::new(&schedules).is_err());
    }

    #[test]
    fn test_disabled_schedules_are_skipped() {
        let mut schedules = profiles::defaults();
        schedules[0].enabled = false;
        let book = ScheduleBook::new(&schedules).unwrap();
        assert_eq!(book.schedules().count(), 2);
        assert!(book
            .preview(friday_midnight(), 48)
            .iter()
            .all(|r| r.job != RunType::DailyMirror));
    }
}
