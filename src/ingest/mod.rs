//! Log ingestion: tailing, marker parsing, tracking feed, reconciliation.

pub mod classify;
pub mod markers;
pub mod parser;
pub mod reconcile;
pub mod tailer;
pub mod tracking;

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

pub use self::parser::{MarkerParser, ParsedRun};
pub use self::tailer::{Cursor, LogTailer, StartMode, TailOutcome};
pub use self::tracking::{TrackingEntry, TrackingFeedReader};

/// A recoverable problem found while reading a source. Anomalies never
/// abort a poll cycle; they are logged and journaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// A run was opened while another was still open.
    DuplicateStart {
        job: String,
        started_at: Option<NaiveDateTime>,
    },
    /// A completion or failure marker arrived with no open run.
    OrphanTerminal { line: String },
    /// A line that looks like a marker but fits no known shape.
    MalformedMarker { line: String },
    /// A marker whose embedded timestamp could not be parsed.
    BadTimestamp { line: String },
    MalformedTrackingLine { line: String },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::DuplicateStart { .. } => "duplicate_start",
            Anomaly::OrphanTerminal { .. } => "orphan_terminal",
            Anomaly::MalformedMarker { .. } => "malformed_marker",
            Anomaly::BadTimestamp { .. } => "bad_timestamp",
            Anomaly::MalformedTrackingLine { .. } => "malformed_tracking_line",
        }
    }
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::DuplicateStart { job, started_at } => match started_at {
                Some(ts) => write!(f, "{job} run started {ts} never closed; marked unknown"),
                None => write!(f, "{job} run never closed; marked unknown"),
            },
            Anomaly::OrphanTerminal { line } => write!(f, "terminal marker with no open run: {line}"),
            Anomaly::MalformedMarker { line } => write!(f, "unrecognized marker line: {line}"),
            Anomaly::BadTimestamp { line } => write!(f, "unparseable marker timestamp: {line}"),
            Anomaly::MalformedTrackingLine { line } => write!(f, "malformed tracking line: {line}"),
        }
    }
}

/// Split off every complete `\n`-terminated line in `buffer`, leaving the
/// unterminated tail in place. Yields each line (without `\r\n`) and its
/// length in bytes including the terminator.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<(String, u64)> {
    let mut lines = Vec::new();
    let mut start = 0;
    while let Some(pos) = buffer[start..].iter().position(|b| *b == b'\n') {
        let end = start + pos;
        let text = String::from_utf8_lossy(&buffer[start..end]);
        lines.push((text.trim_end_matches('\r').to_string(), (end + 1 - start) as u64));
        start = end + 1;
    }
    buffer.drain(..start);
    lines
}
