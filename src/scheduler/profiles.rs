//! Default backup job calendar.

use super::Schedule;
use crate::runs::RunType;

/// Return the default out-of-box schedules.
pub fn defaults() -> Vec<Schedule> {
    vec![
        Schedule {
            name: "Daily Plex Backup".to_string(),
            cron_expr: "0 0 3 * * *".to_string(), // 3am daily
            job: RunType::DailyMirror,
            enabled: true,
        },
        Schedule {
            name: "Weekly Snapshot Cleanup".to_string(),
            cron_expr: "0 0 4 * * Sun".to_string(), // 4am Sunday
            job: RunType::Cleanup,
            enabled: true,
        },
        Schedule {
            name: "Monthly Config Backup".to_string(),
            cron_expr: "0 0 2 1 * *".to_string(), // 2am on the 1st
            job: RunType::ScriptBackup,
            enabled: true,
        },
    ]
}
