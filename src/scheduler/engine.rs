use std::time::Duration;

use chrono::Local;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cycle::{Ingestor, PollState};
use crate::analysis::MetricsService;
use crate::config::SourcesConfig;

/// Main poller loop.
/// Runs one ingestion cycle per tick on the blocking pool; a cycle always
/// finishes before the next tick is awaited, so cycles never overlap.
pub async fn run_poller_loop(
    ingestor: Ingestor,
    sources: SourcesConfig,
    initial: PollState,
    interval: Duration,
    metrics: MetricsService,
    cancel: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "Poller started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = Some(initial);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Poller stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let mut current = match state.take() {
            Some(current) => current,
            None => match PollState::restore(&sources, ingestor.cursors()) {
                Ok(restored) => restored,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "failed to restore poll state; retrying next tick");
                    continue;
                }
            },
        };

        let cycle = ingestor.clone();
        let now = Local::now().naive_local();
        let handle = tokio::task::spawn_blocking(move || {
            let result = cycle.run_cycle(&mut current, now);
            (current, result)
        });

        match handle.await {
            Ok((returned, result)) => {
                state = Some(returned);
                match result {
                    Ok(report) => {
                        if report.changed() {
                            metrics.invalidate();
                            info!(
                                inserted = report.inserted,
                                updated = report.updated,
                                conflicts = report.conflicts,
                                anomalies = report.anomalies,
                                retracted = report.retracted,
                                expired = report.expired_placeholders,
                                "poll cycle stored changes"
                            );
                        } else {
                            debug!(bytes_read = report.bytes_read, "poll cycle idle");
                        }
                        if report.log_absent {
                            warn!(path = %sources.backup_log.display(), "backup log not found");
                        }
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "poll cycle failed; retrying from last cursor");
                    }
                }
            }
            Err(join_err) => {
                // state went down with the task; it is rebuilt from the cursor store
                error!(error = %join_err, "poll cycle panicked");
            }
        }
    }
}
