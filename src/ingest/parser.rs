//! Marker-driven state machine that turns backup log lines into run
//! fragments.
//!
//! The parser is fed raw byte chunks in file order and keeps a partial
//! trailing line between chunks, so splitting the input at any byte offset
//! produces the same fragments as parsing it in one go.

use std::collections::VecDeque;

use chrono::{NaiveDate, NaiveDateTime};

use super::classify::{self, LineCue};
use super::markers::{self, Marker};
use super::Anomaly;
use crate::runs::{RunKey, RunStatus, RunType};

pub const DEFAULT_EXCERPT_CAP: usize = 64 * 1024;
const TRUNCATION_NOTE: &str = "[... truncated ...]";

/// Fields extracted from one contiguous marker block. `status` is `None`
/// while the block is still open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRun {
    pub run_type: RunType,
    pub job: String,
    pub started_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    pub status: Option<RunStatus>,
    pub exit_code: Option<i32>,
    pub bytes_sent: Option<u64>,
    pub bytes_received: Option<u64>,
    pub total_size: Option<u64>,
    pub raw_excerpt: String,
}

impl ParsedRun {
    pub fn date(&self) -> NaiveDate {
        self.started_at.date()
    }
}

/// An open block whose run type changed after its opening marker. Whatever
/// was published for it under `from` no longer describes any run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retagged {
    pub from: RunType,
    pub started_at: NaiveDateTime,
}

impl Retagged {
    pub fn key(&self) -> RunKey {
        (self.started_at.date(), self.from)
    }
}

/// Output of one [`MarkerParser::feed`] call: runs closed by this chunk,
/// blocks retagged within it and anomalies met along the way.
#[derive(Debug, Default)]
pub struct ParseBatch {
    pub runs: Vec<ParsedRun>,
    pub retagged: Vec<Retagged>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, Default)]
struct TransferStats {
    bytes_sent: Option<u64>,
    bytes_received: Option<u64>,
    total_size: Option<u64>,
}

impl TransferStats {
    /// Later statistics lines overwrite earlier ones.
    fn observe(&mut self, line: &str) {
        if let Some((sent, received)) = markers::parse_sent_received(line) {
            self.bytes_sent = Some(sent);
            self.bytes_received = Some(received);
        }
        if let Some(total) = markers::parse_total_size(line) {
            self.total_size = Some(total);
        }
    }
}

/// Verbatim block text, dropping the oldest lines once over `cap` bytes.
#[derive(Debug, Clone)]
struct Excerpt {
    lines: VecDeque<String>,
    len: usize,
    cap: usize,
    truncated: bool,
}

impl Excerpt {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            len: 0,
            cap: cap.max(1),
            truncated: false,
        }
    }

    fn push(&mut self, line: &str) {
        let mut line = line.to_string();
        if line.len() > self.cap {
            let mut cut = self.cap;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            self.truncated = true;
        }
        self.len += line.len() + 1;
        self.lines.push_back(line);
        while self.len > self.cap && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.len -= old.len() + 1;
                self.truncated = true;
            }
        }
    }

    fn render(&self) -> String {
        let mut out = String::with_capacity(self.len + TRUNCATION_NOTE.len() + 1);
        if self.truncated {
            out.push_str(TRUNCATION_NOTE);
            out.push('\n');
        }
        for (i, line) in self.lines.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(line);
        }
        out
    }
}

/// One run's share of a block.
#[derive(Debug, Clone)]
struct Part {
    run_type: RunType,
    stats: TransferStats,
    excerpt: Excerpt,
}

impl Part {
    fn new(run_type: RunType, cap: usize) -> Self {
        Self {
            run_type,
            stats: TransferStats::default(),
            excerpt: Excerpt::new(cap),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenBlock {
    job: String,
    /// `None` when the opening marker's timestamp was unreadable; such a
    /// block absorbs its lines but cannot be dated and is dropped at close.
    started_at: Option<NaiveDateTime>,
    main: Part,
    /// Present once a Sunday mirror block reaches its weekly snapshot cue.
    snapshot: Option<Part>,
    /// Bytes of complete lines consumed since the opening marker.
    bytes: u64,
}

impl OpenBlock {
    fn new(job: &str, started_at: Option<NaiveDateTime>, run_type: RunType, cap: usize) -> Self {
        Self {
            job: job.to_string(),
            started_at,
            main: Part::new(run_type, cap),
            snapshot: None,
            bytes: 0,
        }
    }

    /// Returns the previous run type when `line` retags the block.
    fn observe(&mut self, line: &str) -> Option<RunType> {
        let mut previous = None;
        match classify::classify_line(self.main.run_type, line) {
            Some(LineCue::Retag(run_type)) if run_type != self.main.run_type => {
                previous = Some(std::mem::replace(&mut self.main.run_type, run_type));
            }
            Some(LineCue::SnapshotSplit) if self.snapshot.is_none() => {
                self.snapshot = Some(Part::new(RunType::Snapshot, self.main.excerpt.cap));
            }
            _ => {}
        }
        let part = match self.snapshot.as_mut() {
            Some(snapshot) => snapshot,
            None => &mut self.main,
        };
        part.stats.observe(line);
        part.excerpt.push(line);
        previous
    }

    fn record_terminal(&mut self, line: &str) {
        self.main.excerpt.push(line);
        if let Some(snapshot) = self.snapshot.as_mut() {
            snapshot.excerpt.push(line);
        }
    }

    fn finish(
        self,
        status: Option<RunStatus>,
        completed_at: Option<NaiveDateTime>,
        exit_code: Option<i32>,
    ) -> Vec<ParsedRun> {
        let Some(started_at) = self.started_at else {
            return Vec::new();
        };
        let job = self.job;
        std::iter::once(self.main)
            .chain(self.snapshot)
            .map(|part| ParsedRun {
                run_type: part.run_type,
                job: job.clone(),
                started_at,
                completed_at,
                status,
                exit_code,
                bytes_sent: part.stats.bytes_sent,
                bytes_received: part.stats.bytes_received,
                total_size: part.stats.total_size,
                raw_excerpt: part.excerpt.render(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum State {
    Idle,
    InRun(OpenBlock),
}

/// Line-oriented `Idle`/`InRun` state machine over the backup log.
#[derive(Debug, Clone)]
pub struct MarkerParser {
    state: State,
    partial: Vec<u8>,
    excerpt_cap: usize,
}

impl Default for MarkerParser {
    fn default() -> Self {
        Self::new(DEFAULT_EXCERPT_CAP)
    }
}

impl MarkerParser {
    pub fn new(excerpt_cap: usize) -> Self {
        Self {
            state: State::Idle,
            partial: Vec::new(),
            excerpt_cap,
        }
    }

    /// Consume the next chunk of the file. Returns runs closed within it.
    pub fn feed(&mut self, chunk: &[u8]) -> ParseBatch {
        self.partial.extend_from_slice(chunk);
        let mut batch = ParseBatch::default();
        for (line, len) in super::drain_lines(&mut self.partial) {
            self.consume_line(&line, len, &mut batch);
        }
        batch
    }

    /// The block still open at end of input, with `status` unset. A Sunday
    /// block past its snapshot cue yields both halves.
    pub fn open_runs(&self) -> Vec<ParsedRun> {
        match &self.state {
            State::InRun(block) => block.clone().finish(None, None, None),
            State::Idle => Vec::new(),
        }
    }

    /// [`open_runs`](Self::open_runs) for a log that has gone quiet. A
    /// cleanup block has no closing marker, so it is reported finished; the
    /// block itself stays open and later lines still extend it.
    pub fn quiet_runs(&self) -> Vec<ParsedRun> {
        match &self.state {
            State::InRun(block) if block.main.run_type == RunType::Cleanup => {
                block.clone().finish(Some(RunStatus::Success), None, None)
            }
            _ => self.open_runs(),
        }
    }

    /// Bytes fed but not yet settled: the partial trailing line plus the
    /// open block. A persisted cursor backs off by this much so a restart
    /// re-reads the open block from its opening marker.
    pub fn pending_bytes(&self) -> u64 {
        let open = match &self.state {
            State::InRun(block) => block.bytes,
            State::Idle => 0,
        };
        self.partial.len() as u64 + open
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Forget all state, e.g. after the file was rotated.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.partial.clear();
    }

    fn consume_line(&mut self, line: &str, len: u64, batch: &mut ParseBatch) {
        match markers::parse_marker(line) {
            Some(marker @ (Marker::Start { .. } | Marker::Cleanup { .. })) => {
                self.close_for_new_block(batch);
                let started_at = markers::parse_timestamp(marker.timestamp());
                if started_at.is_none() {
                    batch.anomalies.push(Anomaly::BadTimestamp {
                        line: line.to_string(),
                    });
                }
                let cleanup = matches!(marker, Marker::Cleanup { .. });
                let run_type = classify::classify_opening(marker.job(), cleanup);
                let mut block = OpenBlock::new(marker.job(), started_at, run_type, self.excerpt_cap);
                block.bytes = len;
                block.main.excerpt.push(line);
                self.state = State::InRun(block);
            }
            Some(marker) => {
                let State::InRun(mut block) = std::mem::replace(&mut self.state, State::Idle) else {
                    batch.anomalies.push(Anomaly::OrphanTerminal {
                        line: line.to_string(),
                    });
                    return;
                };
                let completed_at = markers::parse_timestamp(marker.timestamp());
                if completed_at.is_none() {
                    batch.anomalies.push(Anomaly::BadTimestamp {
                        line: line.to_string(),
                    });
                }
                let (status, exit_code) = match marker {
                    Marker::Failure { code, .. } => (RunStatus::Failed, code),
                    _ => (RunStatus::Success, 0),
                };
                block.record_terminal(line);
                batch
                    .runs
                    .extend(block.finish(Some(status), completed_at, Some(exit_code)));
            }
            None => {
                if markers::looks_like_marker(line) {
                    batch.anomalies.push(Anomaly::MalformedMarker {
                        line: line.to_string(),
                    });
                }
                if let State::InRun(block) = &mut self.state {
                    block.bytes += len;
                    let retag = block.observe(line);
                    if let (Some(from), Some(started_at)) = (retag, block.started_at) {
                        batch.retagged.push(Retagged { from, started_at });
                    }
                }
            }
        }
    }

    /// A new block is opening. Cleanup blocks have no terminal marker and
    /// end cleanly here; any other open block was never closed.
    fn close_for_new_block(&mut self, batch: &mut ParseBatch) {
        let State::InRun(block) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        if block.main.run_type == RunType::Cleanup {
            batch.runs.extend(block.finish(Some(RunStatus::Success), None, None));
        } else {
            batch.anomalies.push(Anomaly::DuplicateStart {
                job: block.job.clone(),
                started_at: block.started_at,
            });
            batch.runs.extend(block.finish(Some(RunStatus::Unknown), None, None));
        }
    }
}

/// Parse a complete log in one pass, including any block left open.
pub fn parse_all(text: &[u8], excerpt_cap: usize) -> (Vec<ParsedRun>, Vec<Anomaly>) {
    let mut parser = MarkerParser::new(excerpt_cap);
    let batch = parser.feed(text);
    let mut runs = batch.runs;
    runs.extend(parser.open_runs());
    (runs, batch.anomalies)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAILY: &str = "\
=== Plex Backup Started: Fri Feb 20 03:00:01 AM EST 2026 ===
sending incremental file list
Library/Application Support/Plex Media Server/Preferences.xml

sent 24,265,611 bytes  received 114,210,946 bytes  177,543.21 bytes/sec
total size is 8,081,447,228  speedup is 58.36
=== Plex Backup Completed Successfully: Fri Feb 20 03:13:23 AM EST 2026 ===
";

    const SUNDAY: &str = "\
=== Plex Backup Started: Sun Feb 22 03:00:00 AM EST 2026 ===
sent 1,000 bytes  received 2,000 bytes  300.00 bytes/sec
total size is 8,000,000,000  speedup is 50.00
Sunday detected - creating weekly snapshot
sent 5,000 bytes  received 6,000 bytes  900.00 bytes/sec
total size is 8,100,000,000  speedup is 51.00
=== Plex Backup Completed Successfully: Sun Feb 22 03:40:00 AM EST 2026 ===
";

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 2, d)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_daily_success_block() {
        let (runs, anomalies) = parse_all(DAILY.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert!(anomalies.is_empty());
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert_eq!(run.run_type, RunType::DailyMirror);
        assert_eq!(run.job, "Plex");
        assert_eq!(run.status, Some(RunStatus::Success));
        assert_eq!(run.started_at, at(20, 3, 0, 1));
        assert_eq!(run.completed_at, Some(at(20, 3, 13, 23)));
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.bytes_sent, Some(24_265_611));
        assert_eq!(run.bytes_received, Some(114_210_946));
        assert_eq!(run.total_size, Some(8_081_447_228));
        assert!(run.raw_excerpt.starts_with("=== Plex Backup Started"));
        assert!(run.raw_excerpt.ends_with("03:13:23 AM EST 2026 ==="));
    }

    #[test]
    fn test_failure_block_has_exit_code_and_no_stats() {
        let log = "\
=== Plex Backup Started: Mon Feb 23 03:00:00 AM EST 2026 ===
rsync: connection unexpectedly closed
=== Plex Backup FAILED with code 12: Mon Feb 23 03:01:10 AM EST 2026 ===
";
        let (runs, _) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, Some(RunStatus::Failed));
        assert_eq!(runs[0].exit_code, Some(12));
        assert_eq!(runs[0].bytes_sent, None);
        assert_eq!(runs[0].total_size, None);
    }

    #[test]
    fn test_duplicate_start_closes_prior_as_unknown() {
        let log = "\
=== Plex Backup Started: Fri Feb 20 03:00:00 AM EST 2026 ===
sending incremental file list
=== Plex Backup Started: Sat Feb 21 03:00:00 AM EST 2026 ===
=== Plex Backup Completed Successfully: Sat Feb 21 03:10:00 AM EST 2026 ===
";
        let (runs, anomalies) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].date(), at(20, 0, 0, 0).date());
        assert_eq!(runs[0].status, Some(RunStatus::Unknown));
        assert_eq!(runs[1].status, Some(RunStatus::Success));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind(), "duplicate_start");
    }

    #[test]
    fn test_unterminated_block_stays_open() {
        let log = "\
=== Plex Backup Started: Mon Feb 23 03:00:00 AM EST 2026 ===
sending incremental file list
";
        let mut parser = MarkerParser::default();
        let batch = parser.feed(log.as_bytes());
        assert!(batch.runs.is_empty());
        assert_eq!(parser.pending_bytes(), log.len() as u64);

        let open = parser.open_runs();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, None);
        assert_eq!(open[0].completed_at, None);

        let batch = parser.feed(b"=== Plex Backup Completed Successfully: Mon Feb 23 03:20:00 AM EST 2026 ===\n");
        assert_eq!(batch.runs.len(), 1);
        assert_eq!(batch.runs[0].status, Some(RunStatus::Success));
        assert!(parser.is_idle());
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn test_split_at_any_offset_matches_whole_parse() {
        let log = format!("{DAILY}{SUNDAY}=== Plex Backup Started: Mon Feb 23 03:00:00 AM EST 2026 ===\nsent 9 bytes");
        let (whole, _) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        for split in 0..=log.len() {
            let (head, tail) = log.as_bytes().split_at(split);
            let mut parser = MarkerParser::default();
            let mut runs = parser.feed(head).runs;
            runs.extend(parser.feed(tail).runs);
            runs.extend(parser.open_runs());
            assert_eq!(runs, whole, "split at byte {split}");
        }
    }

    #[test]
    fn test_sunday_block_splits_into_mirror_and_snapshot() {
        let (runs, _) = parse_all(SUNDAY.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert_eq!(runs.len(), 2);
        let (mirror, snapshot) = (&runs[0], &runs[1]);
        assert_eq!(mirror.run_type, RunType::DailyMirror);
        assert_eq!(snapshot.run_type, RunType::Snapshot);
        assert_eq!(mirror.date(), snapshot.date());
        assert_eq!(mirror.total_size, Some(8_000_000_000));
        assert_eq!(snapshot.total_size, Some(8_100_000_000));
        assert_eq!(snapshot.bytes_sent, Some(5_000));
        assert_eq!(snapshot.status, Some(RunStatus::Success));
        assert!(snapshot.raw_excerpt.starts_with("Sunday detected"));
        assert!(!mirror.raw_excerpt.contains("weekly snapshot"));
    }

    #[test]
    fn test_cleanup_block_closes_on_next_marker() {
        let log = "\
=== Plex Snapshot Cleanup - Sun Feb 22 04:00:00 AM EST 2026 ====
Removing snapshot 2026-01-18
=== Plex Backup Started: Mon Feb 23 03:00:00 AM EST 2026 ===
";
        let (runs, anomalies) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert!(anomalies.is_empty());
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_type, RunType::Cleanup);
        assert_eq!(runs[0].status, Some(RunStatus::Success));
        assert_eq!(runs[0].exit_code, None);
        assert_eq!(runs[1].status, None);
    }

    #[test]
    fn test_quiet_log_reports_cleanup_finished() {
        let mut parser = MarkerParser::default();
        parser.feed(b"=== Plex Snapshot Cleanup - Sun Feb 22 04:00:00 AM EST 2026 ====\nRemoving snapshot 2026-01-18\n");
        assert_eq!(parser.open_runs()[0].status, None);

        let quiet = parser.quiet_runs();
        assert_eq!(quiet.len(), 1);
        assert_eq!(quiet[0].status, Some(RunStatus::Success));
        assert!(!parser.is_idle());

        parser.feed(b"Removing snapshot 2026-01-25\n");
        let batch = parser.feed(b"=== Plex Backup Started: Mon Feb 23 03:00:00 AM EST 2026 ===\n");
        assert_eq!(batch.runs.len(), 1);
        assert!(batch.runs[0].raw_excerpt.contains("2026-01-25"));

        let mut daily = MarkerParser::default();
        daily.feed(b"=== Plex Backup Started: Mon Feb 23 03:00:00 AM EST 2026 ===\n");
        assert_eq!(daily.quiet_runs()[0].status, None);
    }

    #[test]
    fn test_manual_and_script_blocks() {
        let log = "\
=== Plex Manual Backup Started: Mon Feb 23 02:00:00 PM EST 2026 ===
=== Plex Manual Backup Completed Successfully: Mon Feb 23 02:05:00 PM EST 2026 ===
=== Plex Scripts Backup Started: Sun Mar 01 02:00:00 AM EST 2026 ===
=== Plex Scripts Backup Completed Successfully: Sun Mar 01 02:00:30 AM EST 2026 ===
=== Plex Backup Started: Mon Mar 02 10:00:00 AM EST 2026 ===
Backup triggered manually from dashboard
=== Plex Backup Completed Successfully: Mon Mar 02 10:09:00 AM EST 2026 ===
";
        let (runs, _) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        let types: Vec<_> = runs.iter().map(|r| r.run_type).collect();
        assert_eq!(types, vec![RunType::Manual, RunType::ScriptBackup, RunType::Manual]);
    }

    #[test]
    fn test_retag_is_reported_with_previous_type() {
        let mut parser = MarkerParser::default();
        let batch = parser.feed(b"=== Plex Backup Started: Mon Mar 02 10:00:00 AM EST 2026 ===\n");
        assert!(batch.retagged.is_empty());
        assert_eq!(parser.open_runs()[0].run_type, RunType::DailyMirror);

        let batch = parser.feed(b"Backup triggered manually from dashboard\nTriggered manually, again\n");
        assert_eq!(
            batch.retagged,
            vec![Retagged {
                from: RunType::DailyMirror,
                started_at: NaiveDate::from_ymd_opt(2026, 3, 2)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap(),
            }]
        );
        assert_eq!(batch.retagged[0].key().1, RunType::DailyMirror);
        assert_eq!(parser.open_runs()[0].run_type, RunType::Manual);
    }

    #[test]
    fn test_orphan_terminal_and_malformed_marker_are_reported() {
        let log = "\
=== Plex Backup Completed Successfully: Fri Feb 20 03:13:23 AM EST 2026 ===
=== Plex Backup Started ===
";
        let (runs, anomalies) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert!(runs.is_empty());
        let kinds: Vec<_> = anomalies.iter().map(Anomaly::kind).collect();
        assert_eq!(kinds, vec!["orphan_terminal", "malformed_marker"]);
    }

    #[test]
    fn test_bad_start_timestamp_drops_block() {
        let log = "\
=== Plex Backup Started: sometime last night ===
=== Plex Backup Completed Successfully: Fri Feb 20 03:13:23 AM EST 2026 ===
";
        let (runs, anomalies) = parse_all(log.as_bytes(), DEFAULT_EXCERPT_CAP);
        assert!(runs.is_empty());
        assert_eq!(anomalies[0].kind(), "bad_timestamp");
    }

    #[test]
    fn test_excerpt_drops_oldest_lines_over_cap() {
        let mut log = String::from("=== Plex Backup Started: Fri Feb 20 03:00:01 AM EST 2026 ===\n");
        for i in 0..100 {
            log.push_str(&format!("file-{i:03}.db\n"));
        }
        log.push_str("=== Plex Backup Completed Successfully: Fri Feb 20 03:13:23 AM EST 2026 ===\n");
        let (runs, _) = parse_all(log.as_bytes(), 256);
        let excerpt = &runs[0].raw_excerpt;
        assert!(excerpt.starts_with(TRUNCATION_NOTE));
        assert!(excerpt.len() <= 256 + TRUNCATION_NOTE.len() + 1);
        assert!(excerpt.contains("file-099.db"));
        assert!(!excerpt.contains("file-000.db"));
        assert!(excerpt.ends_with("==="));
    }
}
