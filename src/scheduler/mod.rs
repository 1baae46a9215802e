//! Background work: the poll cycle, the loop that drives it, and the
//! calendar of backup jobs the host runs.

pub mod cron;
pub mod cycle;
pub mod engine;
pub mod profiles;

use serde::{Deserialize, Serialize};

use crate::runs::RunType;

pub use self::cron::{ScheduleBook, UpcomingRun};
pub use self::cycle::{CycleReport, Ingestor, PollState};
pub use self::engine::run_poller_loop;

/// A backup job the host's cron runs, kept for previews.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    /// Seconds-first cron expression, e.g. `0 0 3 * * *`.
    #[serde(rename = "cron")]
    pub cron_expr: String,
    pub job: RunType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
