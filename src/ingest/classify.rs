//! Run-type classification from textual cues in marker and block lines.
//!
//! All rules live in [`RULES`]; the first matching rule wins and anything
//! unmatched falls back to [`FALLBACK`]. File paths and schedule timing are
//! never consulted.

use crate::runs::RunType;

/// Where a cue is looked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// The block was opened by a `Snapshot Cleanup` marker.
    CleanupMarker,
    /// Case-insensitive substring of the `<Job>` label in the opening marker.
    JobLabel(&'static str),
    /// Case-insensitive substring of any line inside the block.
    BlockText(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub cue: Cue,
    pub run_type: RunType,
}

pub const FALLBACK: RunType = RunType::DailyMirror;

/// Text that starts the weekly snapshot half of a Sunday mirror block.
pub const SNAPSHOT_CUE: &str = "weekly snapshot";

pub const RULES: &[Rule] = &[
    Rule { cue: Cue::CleanupMarker, run_type: RunType::Cleanup },
    Rule { cue: Cue::JobLabel("manual"), run_type: RunType::Manual },
    Rule { cue: Cue::BlockText("triggered manually"), run_type: RunType::Manual },
    Rule { cue: Cue::JobLabel("script"), run_type: RunType::ScriptBackup },
    Rule { cue: Cue::JobLabel("config"), run_type: RunType::ScriptBackup },
    Rule { cue: Cue::BlockText(SNAPSHOT_CUE), run_type: RunType::Snapshot },
];

/// What a block line means for the classification of its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCue {
    /// The whole block belongs to another run type.
    Retag(RunType),
    /// The rest of the block is a weekly snapshot of the same day.
    SnapshotSplit,
}

/// Type of a block from its opening marker.
pub fn classify_opening(job: &str, cleanup_marker: bool) -> RunType {
    let job = job.to_ascii_lowercase();
    RULES
        .iter()
        .find(|rule| match rule.cue {
            Cue::CleanupMarker => cleanup_marker,
            Cue::JobLabel(needle) => job.contains(needle),
            Cue::BlockText(_) => false,
        })
        .map_or(FALLBACK, |rule| rule.run_type)
}

/// Block-text cues only apply to blocks still carrying the fallback type;
/// an explicit job label is never overridden.
pub fn classify_line(current: RunType, line: &str) -> Option<LineCue> {
    if current != FALLBACK {
        return None;
    }
    let line = line.to_ascii_lowercase();
    RULES.iter().find_map(|rule| match rule.cue {
        Cue::BlockText(needle) if line.contains(needle) => Some(if rule.run_type == RunType::Snapshot {
            LineCue::SnapshotSplit
        } else {
            LineCue::Retag(rule.run_type)
        }),
        _ => None,
    })
}
