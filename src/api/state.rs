use std::sync::Arc;

use crate::analysis::MetricsService;
use crate::scheduler::ScheduleBook;
use crate::storage::{DiagnosticLog, RunStore};
use crate::trigger::TriggerService;

/// Shared handles for the request handlers. Every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub store: RunStore,
    pub diagnostics: DiagnosticLog,
    pub metrics: MetricsService,
    pub trigger: TriggerService,
    pub schedules: Arc<ScheduleBook>,
}
