//! One ingestion pass over both sources.
//!
//! All mutable ingestion state lives in [`PollState`], which the caller owns
//! and hands to [`Ingestor::run_cycle`]. Cursors are persisted only after
//! every record of the pass has been stored, so an aborted pass is simply
//! re-read from the last committed position.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SourcesConfig;
use crate::ingest::parser::{ParsedRun, Retagged};
use crate::ingest::{reconcile, Anomaly, LogTailer, MarkerParser, StartMode, TailOutcome, TrackingFeedReader};
use crate::storage::{CursorStore, DiagnosticLog, RunStore, UpsertOutcome};

/// Tailers and incremental readers for the backup log and tracking feed.
#[derive(Debug, Clone)]
pub struct PollState {
    pub log: LogTailer,
    pub parser: MarkerParser,
    pub tracking: LogTailer,
    pub feed: TrackingFeedReader,
}

impl PollState {
    /// Resume both files from their stored cursors.
    pub fn restore(sources: &SourcesConfig, cursors: &CursorStore) -> Result<Self> {
        let log_cursor = cursors
            .load(&sources.backup_log)
            .context("failed to load backup log cursor")?;
        let tracking_cursor = cursors
            .load(&sources.tracking_feed)
            .context("failed to load tracking feed cursor")?;
        debug!(
            log_offset = log_cursor.as_ref().map(|c| c.offset),
            tracking_offset = tracking_cursor.as_ref().map(|c| c.offset),
            "restored poll state"
        );
        Ok(Self {
            log: LogTailer::resume(&sources.backup_log, sources.start_mode, log_cursor),
            parser: MarkerParser::new(sources.max_excerpt_bytes),
            tracking: LogTailer::resume(&sources.tracking_feed, sources.start_mode, tracking_cursor),
            feed: TrackingFeedReader::new(),
        })
    }

    /// Read both files from the start, ignoring stored cursors.
    pub fn backfill(sources: &SourcesConfig) -> Self {
        Self {
            log: LogTailer::new(&sources.backup_log, StartMode::Beginning),
            parser: MarkerParser::new(sources.max_excerpt_bytes),
            tracking: LogTailer::new(&sources.tracking_feed, StartMode::Beginning),
            feed: TrackingFeedReader::new(),
        }
    }

    fn rewind(&mut self) {
        self.log.rewind();
        self.parser.reset();
        self.tracking.rewind();
        self.feed.reset();
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub bytes_read: u64,
    pub log_absent: bool,
    pub tracking_absent: bool,
    pub rotated: bool,
    pub fragments: usize,
    pub tracking_entries: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub anomalies: usize,
    /// Open records withdrawn because their block changed run type.
    pub retracted: usize,
    pub expired_placeholders: usize,
}

impl CycleReport {
    /// Whether stored records changed.
    pub fn changed(&self) -> bool {
        self.inserted + self.updated + self.retracted + self.expired_placeholders > 0
    }
}

#[derive(Clone)]
pub struct Ingestor {
    store: RunStore,
    cursors: CursorStore,
    diagnostics: DiagnosticLog,
    placeholder_timeout: chrono::Duration,
}

impl Ingestor {
    pub fn new(
        store: RunStore,
        cursors: CursorStore,
        diagnostics: DiagnosticLog,
        placeholder_timeout: chrono::Duration,
    ) -> Self {
        Self {
            store,
            cursors,
            diagnostics,
            placeholder_timeout,
        }
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// Poll both sources once and store what they yield. On error the
    /// state is rewound to the last committed cursors.
    pub fn run_cycle(&self, state: &mut PollState, now: NaiveDateTime) -> Result<CycleReport> {
        let result = self.try_cycle(state, now);
        if result.is_err() {
            state.rewind();
        }
        result
    }

    fn try_cycle(&self, state: &mut PollState, now: NaiveDateTime) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut anomalies: Vec<(String, Anomaly)> = Vec::new();

        let mut fragments: Vec<ParsedRun> = Vec::new();
        let mut retagged: Vec<Retagged> = Vec::new();
        let log_source = state.log.path().display().to_string();
        let mut log_quiet = false;
        match state.log.poll()? {
            TailOutcome::Absent => report.log_absent = true,
            TailOutcome::Chunk(chunk) => {
                log_quiet = chunk.bytes.is_empty() && !chunk.rotated;
                if chunk.rotated {
                    state.parser.reset();
                    report.rotated = true;
                }
                report.bytes_read += chunk.bytes.len() as u64;
                let batch = state.parser.feed(&chunk.bytes);
                fragments.extend(batch.runs);
                retagged.extend(batch.retagged);
                anomalies.extend(batch.anomalies.into_iter().map(|a| (log_source.clone(), a)));
            }
        }
        if log_quiet {
            fragments.extend(state.parser.quiet_runs());
        } else {
            fragments.extend(state.parser.open_runs());
        }
        report.fragments = fragments.len();

        let tracking_source = state.tracking.path().display().to_string();
        let mut entries = BTreeMap::new();
        match state.tracking.poll()? {
            TailOutcome::Absent => report.tracking_absent = true,
            TailOutcome::Chunk(chunk) => {
                if chunk.rotated {
                    state.feed.reset();
                    report.rotated = true;
                }
                report.bytes_read += chunk.bytes.len() as u64;
                let batch = state.feed.feed(&chunk.bytes);
                entries = batch.entries;
                anomalies.extend(batch.anomalies.into_iter().map(|a| (tracking_source.clone(), a)));
            }
        }
        report.tracking_entries = entries.len();

        for retag in &retagged {
            let key = retag.key();
            let withdrawn = self
                .store
                .retract_open(key, retag.started_at)
                .with_context(|| format!("failed to withdraw {} {}", key.0, key.1))?;
            if withdrawn {
                report.retracted += 1;
                debug!(date = %key.0, run_type = %key.1, "withdrew open record of retagged block");
            }
        }

        let merged = reconcile::merge(fragments, &entries);
        for run in merged.runs {
            let key = (run.date, run.run_type);
            let stored = self
                .store
                .upsert(run)
                .with_context(|| format!("failed to store {} {}", key.0, key.1))?;
            match stored.outcome {
                UpsertOutcome::Inserted => report.inserted += 1,
                UpsertOutcome::Updated => report.updated += 1,
                UpsertOutcome::Unchanged => report.unchanged += 1,
            }
            if stored.outcome != UpsertOutcome::Unchanged {
                debug!(
                    date = %key.0,
                    run_type = %key.1,
                    status = %stored.run.status,
                    outcome = ?stored.outcome,
                    "stored run"
                );
            }
            if let Some(conflict) = stored.conflict {
                report.conflicts += 1;
                info!(%conflict, "reconciliation conflict; tracking status wins");
                if let Err(e) = self.diagnostics.record_conflict(&conflict) {
                    warn!(error = %e, "failed to journal conflict");
                }
            }
        }

        report.anomalies = anomalies.len();
        for (source, anomaly) in &anomalies {
            warn!(source = %source, kind = anomaly.kind(), "{anomaly}");
            if let Err(e) = self.diagnostics.record_anomaly(source, anomaly) {
                warn!(error = %e, "failed to journal anomaly");
            }
        }

        report.expired_placeholders = self
            .store
            .expire_stale_placeholders(now, self.placeholder_timeout)
            .context("failed to expire manual placeholders")?;
        if report.expired_placeholders > 0 {
            info!(
                count = report.expired_placeholders,
                "manual runs without log evidence marked unknown"
            );
        }

        if let Some(cursor) = state.log.checkpoint(state.parser.pending_bytes()) {
            self.cursors.save(&cursor).context("failed to save backup log cursor")?;
            state.log.commit(cursor);
        }
        if let Some(cursor) = state.tracking.checkpoint(state.feed.pending_bytes()) {
            self.cursors.save(&cursor).context("failed to save tracking feed cursor")?;
            state.tracking.commit(cursor);
        }

        Ok(report)
    }
}
