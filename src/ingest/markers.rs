//! Line grammar for the backup log.
//!
//! Every load-bearing line shape has its own pattern so each can be tested
//! and extended without touching the others:
//!
//! ```text
//! === <Job> Backup Started: <timestamp> ===
//! === <Job> Backup Completed Successfully: <timestamp> ===
//! === <Job> Backup FAILED with code <N>: <timestamp> ===
//! === <Job> Snapshot Cleanup - <timestamp> ====
//! sent <N> bytes  received <N> bytes  <rate> bytes/sec
//! total size is <N>  speedup is <float>
//! ```

use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::Regex;

static START_RE: Lazy<Regex> =
    Lazy::new(|| compile_regex(r"^\s*===\s*(?:(?P<job>.*?)\s+)?Backup Started:\s*(?P<ts>.+?)\s*===\s*$"));
static SUCCESS_RE: Lazy<Regex> = Lazy::new(|| {
    compile_regex(r"^\s*===\s*(?:(?P<job>.*?)\s+)?Backup Completed Successfully:\s*(?P<ts>.+?)\s*===\s*$")
});
static FAILED_RE: Lazy<Regex> = Lazy::new(|| {
    compile_regex(
        r"^\s*===\s*(?:(?P<job>.*?)\s+)?Backup FAILED with code (?P<code>-?\d+):\s*(?P<ts>.+?)\s*===\s*$",
    )
});
static CLEANUP_RE: Lazy<Regex> = Lazy::new(|| {
    compile_regex(r"^\s*===\s*(?:(?P<job>.*?)\s+)?Snapshot Cleanup -\s*(?P<ts>.+?)\s*====\s*$")
});
static SENT_RE: Lazy<Regex> =
    Lazy::new(|| compile_regex(r"sent\s+(?P<sent>[\d,.]+)\s+bytes\s+received\s+(?P<received>[\d,.]+)\s+bytes"));
static TOTAL_SIZE_RE: Lazy<Regex> = Lazy::new(|| compile_regex(r"total size is\s+(?P<total>[\d,.]+)"));

/// Formats produced by `date(1)` under the locales seen on backup hosts,
/// plus ISO forms. `%Z` skips the zone abbreviation while parsing.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%a %b %d %I:%M:%S %p %Z %Y",
    "%a %b %d %H:%M:%S %Z %Y",
    "%a %b %d %I:%M:%S %p %Y",
    "%a %b %d %H:%M:%S %Y",
    "%a %d %b %Y %I:%M:%S %p %Z",
    "%a %d %b %Y %H:%M:%S %Z",
    "%a %d %b %H:%M:%S %Z %Y",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// A recognized marker line. Timestamps are left raw so a bad timestamp can
/// be reported without losing the marker itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker<'a> {
    Start { job: &'a str, timestamp: &'a str },
    Success { job: &'a str, timestamp: &'a str },
    Failure { job: &'a str, code: i32, timestamp: &'a str },
    Cleanup { job: &'a str, timestamp: &'a str },
}

impl<'a> Marker<'a> {
    pub fn job(&self) -> &'a str {
        match self {
            Marker::Start { job, .. }
            | Marker::Success { job, .. }
            | Marker::Failure { job, .. }
            | Marker::Cleanup { job, .. } => job,
        }
    }

    pub fn timestamp(&self) -> &'a str {
        match self {
            Marker::Start { timestamp, .. }
            | Marker::Success { timestamp, .. }
            | Marker::Failure { timestamp, .. }
            | Marker::Cleanup { timestamp, .. } => timestamp,
        }
    }
}

pub fn parse_start(line: &str) -> Option<Marker<'_>> {
    let caps = START_RE.captures(line)?;
    Some(Marker::Start {
        job: caps.name("job").map_or("", |m| m.as_str()),
        timestamp: caps.name("ts")?.as_str(),
    })
}

pub fn parse_success(line: &str) -> Option<Marker<'_>> {
    let caps = SUCCESS_RE.captures(line)?;
    Some(Marker::Success {
        job: caps.name("job").map_or("", |m| m.as_str()),
        timestamp: caps.name("ts")?.as_str(),
    })
}

pub fn parse_failure(line: &str) -> Option<Marker<'_>> {
    let caps = FAILED_RE.captures(line)?;
    Some(Marker::Failure {
        job: caps.name("job").map_or("", |m| m.as_str()),
        code: caps.name("code")?.as_str().parse().ok()?,
        timestamp: caps.name("ts")?.as_str(),
    })
}

pub fn parse_cleanup(line: &str) -> Option<Marker<'_>> {
    let caps = CLEANUP_RE.captures(line)?;
    Some(Marker::Cleanup {
        job: caps.name("job").map_or("", |m| m.as_str()),
        timestamp: caps.name("ts")?.as_str(),
    })
}

/// Try every marker shape in turn.
pub fn parse_marker(line: &str) -> Option<Marker<'_>> {
    if !line.trim_start().starts_with("===") {
        return None;
    }
    parse_start(line)
        .or_else(|| parse_success(line))
        .or_else(|| parse_failure(line))
        .or_else(|| parse_cleanup(line))
}

/// A `===` line mentioning a backup or cleanup that fits no marker shape.
pub fn looks_like_marker(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("===") && (trimmed.contains("Backup") || trimmed.contains("Cleanup"))
}

/// `sent <N> bytes  received <N> bytes`
pub fn parse_sent_received(line: &str) -> Option<(u64, u64)> {
    let caps = SENT_RE.captures(line)?;
    Some((
        parse_count(caps.name("sent")?.as_str())?,
        parse_count(caps.name("received")?.as_str())?,
    ))
}

/// `total size is <N>`
pub fn parse_total_size(line: &str) -> Option<u64> {
    let caps = TOTAL_SIZE_RE.captures(line)?;
    parse_count(caps.name("total")?.as_str())
}

/// Base-10 integer with thousands separators stripped: `24,265,611`.
pub fn parse_count(raw: &str) -> Option<u64> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
}

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_start_marker() {
        let m = parse_start("=== Plex Backup Started: Fri Feb 20 03:00:01 AM EST 2026 ===").unwrap();
        assert_eq!(m.job(), "Plex");
        assert_eq!(m.timestamp(), "Fri Feb 20 03:00:01 AM EST 2026");
    }

    #[test]
    fn test_success_marker() {
        let m = parse_success("=== Plex Backup Completed Successfully: Fri Feb 20 03:13:23 AM EST 2026 ===")
            .unwrap();
        assert_eq!(m.job(), "Plex");
        assert!(parse_start("=== Plex Backup Completed Successfully: x ===").is_none());
    }

    #[test]
    fn test_failure_marker_captures_code() {
        let m = parse_failure("=== Plex Backup FAILED with code 23: Sun Feb 22 03:05:00 AM EST 2026 ===")
            .unwrap();
        assert_eq!(
            m,
            Marker::Failure {
                job: "Plex",
                code: 23,
                timestamp: "Sun Feb 22 03:05:00 AM EST 2026"
            }
        );
    }

    #[test]
    fn test_cleanup_marker_needs_four_equals() {
        let m = parse_cleanup("=== Plex Snapshot Cleanup - Sun Feb 22 04:00:00 AM EST 2026 ====").unwrap();
        assert_eq!(m.job(), "Plex");
        assert!(parse_cleanup("=== Plex Snapshot Cleanup - Sun Feb 22 04:00:00 AM EST 2026 ===").is_none());
    }

    #[test]
    fn test_parse_marker_ignores_ordinary_lines() {
        assert!(parse_marker("sent 1 bytes  received 2 bytes").is_none());
        assert!(parse_marker("=== Plex Backup Started ===").is_none());
        assert!(looks_like_marker("=== Plex Backup Started ==="));
        assert!(!looks_like_marker("=== rsync pass 2 ==="));
    }

    #[test]
    fn test_transfer_statistics() {
        let line = "sent 24,265,611 bytes  received 114,210,946 bytes  1,234.56 bytes/sec";
        assert_eq!(parse_sent_received(line), Some((24_265_611, 114_210_946)));
        assert_eq!(
            parse_total_size("total size is 8,081,447,228  speedup is 58.36"),
            Some(8_081_447_228)
        );
        assert_eq!(parse_total_size("speedup is 58.36"), None);
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(
            parse_timestamp("Mon Feb 23 03:13:23 AM EST 2026"),
            Some(at(2026, 2, 23, 3, 13, 23))
        );
        assert_eq!(
            parse_timestamp("Mon Feb 23 15:13:23 EST 2026"),
            Some(at(2026, 2, 23, 15, 13, 23))
        );
        assert_eq!(
            parse_timestamp("Mon Feb  2 03:00:00 AM EST 2026"),
            Some(at(2026, 2, 2, 3, 0, 0))
        );
        assert_eq!(parse_timestamp("2026-02-23 03:13:23"), Some(at(2026, 2, 23, 3, 13, 23)));
        assert_eq!(parse_timestamp("yesterday-ish"), None);
    }
}
