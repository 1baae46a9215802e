//! Reader for the append-only `YYYY-MM-DD:status` tracking feed.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use super::Anomaly;
use crate::runs::RunStatus;

/// One parsed feed line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingEntry {
    pub date: NaiveDate,
    pub status: RunStatus,
}

impl TrackingEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let (date, status) = line.trim().split_once(':')?;
        let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d").ok()?;
        let status = match status.trim().to_ascii_lowercase().as_str() {
            "success" => RunStatus::Success,
            "failed" | "failure" => RunStatus::Failed,
            _ => return None,
        };
        Some(Self { date, status })
    }
}

#[derive(Debug, Default)]
pub struct TrackingBatch {
    /// Last status seen per date within this batch.
    pub entries: BTreeMap<NaiveDate, RunStatus>,
    pub anomalies: Vec<Anomaly>,
}

/// Incremental feed reader; keeps the unterminated trailing line between
/// chunks.
#[derive(Debug, Clone, Default)]
pub struct TrackingFeedReader {
    partial: Vec<u8>,
}

impl TrackingFeedReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> TrackingBatch {
        self.partial.extend_from_slice(chunk);
        let mut batch = TrackingBatch::default();
        for (line, _) in super::drain_lines(&mut self.partial) {
            if line.trim().is_empty() {
                continue;
            }
            match TrackingEntry::parse(&line) {
                Some(entry) => {
                    batch.entries.insert(entry.date, entry.status);
                }
                None => batch.anomalies.push(Anomaly::MalformedTrackingLine { line }),
            }
        }
        batch
    }

    pub fn pending_bytes(&self) -> u64 {
        self.partial.len() as u64
    }

    pub fn reset(&mut self) {
        self.partial.clear();
    }
}

/// Parse a whole feed at once. A trailing line without newline counts.
pub fn parse_feed(text: &str) -> TrackingBatch {
    let mut reader = TrackingFeedReader::new();
    let mut batch = reader.feed(text.as_bytes());
    if reader.pending_bytes() > 0 {
        let tail = reader.feed(b"\n");
        batch.entries.extend(tail.entries);
        batch.anomalies.extend(tail.anomalies);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_parse_entry() {
        let entry = TrackingEntry::parse("2026-02-20:success").unwrap();
        assert_eq!(entry.date, date("2026-02-20"));
        assert_eq!(entry.status, RunStatus::Success);
        assert_eq!(
            TrackingEntry::parse("2026-02-21:failure").unwrap().status,
            RunStatus::Failed
        );
        assert!(TrackingEntry::parse("2026-02-21").is_none());
        assert!(TrackingEntry::parse("2026-02-30:success").is_none());
        assert!(TrackingEntry::parse("2026-02-21:maybe").is_none());
    }

    #[test]
    fn test_last_line_per_date_wins() {
        let batch = parse_feed("2026-02-20:failed\n2026-02-21:success\n2026-02-20:success\n");
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[&date("2026-02-20")], RunStatus::Success);
        assert!(batch.anomalies.is_empty());
    }

    #[test]
    fn test_malformed_lines_are_reported_and_skipped() {
        let batch = parse_feed("garbage\n\n2026-02-22:failed");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.anomalies.len(), 1);
        assert_eq!(batch.anomalies[0].kind(), "malformed_tracking_line");
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let mut reader = TrackingFeedReader::new();
        let batch = reader.feed(b"2026-02-20:succ");
        assert!(batch.entries.is_empty());
        assert_eq!(reader.pending_bytes(), 15);

        let batch = reader.feed(b"ess\n");
        assert_eq!(batch.entries[&date("2026-02-20")], RunStatus::Success);
        assert_eq!(reader.pending_bytes(), 0);
    }
}
