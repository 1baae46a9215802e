//! Incremental reader for an append-only log file.
//!
//! A tailer remembers how far it has read, notices truncation or
//! replacement of the file, and hands back only the bytes appended since
//! the previous poll. It never waits for data.

use std::fs::{self, File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const MAX_READ_CHUNK_BYTES: u64 = 8 * 1024 * 1024; // 8 MiB per poll

/// Where to begin reading a file that has no persisted cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Backfill the whole history.
    #[default]
    Beginning,
    /// Only ingest what is appended from now on.
    End,
}

/// Identity of the file behind a path. Zero means unknown (non-Unix).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub device: u64,
    pub inode: u64,
}

impl FileFingerprint {
    #[cfg(unix)]
    pub fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn of(_meta: &Metadata) -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.inode != 0
    }

    fn replaced_by(&self, other: &FileFingerprint) -> bool {
        self.is_known() && other.is_known() && self != other
    }
}

/// Persisted resume point for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub path: PathBuf,
    pub offset: u64,
    pub fingerprint: FileFingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailChunk {
    /// Newly appended bytes; empty when nothing changed.
    pub bytes: Vec<u8>,
    pub start_offset: u64,
    /// The file was truncated or replaced and is being read from 0 again.
    pub rotated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailOutcome {
    /// The file does not exist (or cannot be inspected) right now.
    Absent,
    Chunk(TailChunk),
}

#[derive(Debug, Clone)]
pub struct LogTailer {
    path: PathBuf,
    mode: StartMode,
    read_offset: Option<u64>,
    fingerprint: FileFingerprint,
    committed: Option<Cursor>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, mode: StartMode) -> Self {
        Self {
            path: path.into(),
            mode,
            read_offset: None,
            fingerprint: FileFingerprint::default(),
            committed: None,
        }
    }

    /// Continue from a persisted cursor, or fall back to `mode` without one.
    pub fn resume(path: impl Into<PathBuf>, mode: StartMode, cursor: Option<Cursor>) -> Self {
        let mut tailer = Self::new(path, mode);
        if let Some(cursor) = cursor {
            tailer.read_offset = Some(cursor.offset);
            tailer.fingerprint = cursor.fingerprint;
            tailer.committed = Some(cursor);
        }
        tailer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position up to which bytes have been handed out.
    pub fn read_offset(&self) -> Option<u64> {
        self.read_offset
    }

    pub fn poll(&mut self) -> Result<TailOutcome> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    debug!(path = %self.path.display(), "source file absent");
                } else {
                    warn!(path = %self.path.display(), error = %err, "source file unavailable");
                }
                return Ok(TailOutcome::Absent);
            }
        };

        let size = meta.len();
        let fingerprint = FileFingerprint::of(&meta);
        let mut rotated = false;
        let offset = match self.read_offset {
            None => {
                let start = match self.mode {
                    StartMode::Beginning => 0,
                    StartMode::End => size,
                };
                self.committed = Some(Cursor {
                    path: self.path.clone(),
                    offset: start,
                    fingerprint,
                });
                start
            }
            Some(offset) if size < offset || self.fingerprint.replaced_by(&fingerprint) => {
                warn!(
                    path = %self.path.display(),
                    previous_offset = offset,
                    current_size = size,
                    "file truncated or rotated; reading from start"
                );
                rotated = true;
                0
            }
            Some(offset) => offset,
        };
        self.fingerprint = fingerprint;

        let bytes = if size > offset {
            read_range(&self.path, offset, (size - offset).min(MAX_READ_CHUNK_BYTES))?
        } else {
            Vec::new()
        };
        self.read_offset = Some(offset + bytes.len() as u64);
        if !bytes.is_empty() {
            debug!(
                path = %self.path.display(),
                start_offset = offset,
                chunk_len = bytes.len(),
                "read file chunk"
            );
        }

        Ok(TailOutcome::Chunk(TailChunk {
            bytes,
            start_offset: offset,
            rotated,
        }))
    }

    /// Cursor to persist when the consumer still buffers `pending` bytes
    /// (partial line plus open block) of what has been read.
    pub fn checkpoint(&self, pending: u64) -> Option<Cursor> {
        let read_offset = self.read_offset?;
        Some(Cursor {
            path: self.path.clone(),
            offset: read_offset.saturating_sub(pending),
            fingerprint: self.fingerprint,
        })
    }

    /// Record that `cursor` has been persisted.
    pub fn commit(&mut self, cursor: Cursor) {
        self.committed = Some(cursor);
    }

    pub fn committed(&self) -> Option<&Cursor> {
        self.committed.as_ref()
    }

    /// Go back to the last committed cursor after a failed cycle.
    pub fn rewind(&mut self) {
        match &self.committed {
            Some(cursor) => {
                self.read_offset = Some(cursor.offset);
                self.fingerprint = cursor.fingerprint;
            }
            None => {
                self.read_offset = None;
                self.fingerprint = FileFingerprint::default();
            }
        }
    }
}

fn read_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("failed to seek {} to {offset}", path.display()))?;
    let mut buffer = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut buffer)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn chunk(outcome: TailOutcome) -> TailChunk {
        match outcome {
            TailOutcome::Chunk(chunk) => chunk,
            TailOutcome::Absent => panic!("expected a chunk"),
        }
    }

    #[test]
    fn test_absent_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut tailer = LogTailer::new(dir.path().join("missing.log"), StartMode::Beginning);
        assert_eq!(tailer.poll().unwrap(), TailOutcome::Absent);
        assert!(tailer.checkpoint(0).is_none());
    }

    #[test]
    fn test_reads_only_appended_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        append(&path, "one\n");

        let mut tailer = LogTailer::new(&path, StartMode::Beginning);
        let first = chunk(tailer.poll().unwrap());
        assert_eq!(first.bytes, b"one\n");
        assert_eq!(first.start_offset, 0);

        assert!(chunk(tailer.poll().unwrap()).bytes.is_empty());

        append(&path, "two\n");
        let second = chunk(tailer.poll().unwrap());
        assert_eq!(second.bytes, b"two\n");
        assert_eq!(second.start_offset, 4);
        assert!(!second.rotated);
    }

    #[test]
    fn test_end_mode_skips_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        append(&path, "old history\n");

        let mut tailer = LogTailer::new(&path, StartMode::End);
        assert!(chunk(tailer.poll().unwrap()).bytes.is_empty());
        append(&path, "new\n");
        assert_eq!(chunk(tailer.poll().unwrap()).bytes, b"new\n");
    }

    #[test]
    fn test_truncation_rereads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        append(&path, "a fairly long first line\n");

        let mut tailer = LogTailer::new(&path, StartMode::Beginning);
        chunk(tailer.poll().unwrap());

        fs::write(&path, "short\n").unwrap();
        let after = chunk(tailer.poll().unwrap());
        assert!(after.rotated);
        assert_eq!(after.start_offset, 0);
        assert_eq!(after.bytes, b"short\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_replaced_file_is_detected_by_inode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        append(&path, "first generation\n");

        let mut tailer = LogTailer::new(&path, StartMode::Beginning);
        chunk(tailer.poll().unwrap());

        let staged = dir.path().join("backup.log.new");
        fs::write(&staged, "second generation, now longer\n").unwrap();
        fs::rename(&staged, &path).unwrap();

        let after = chunk(tailer.poll().unwrap());
        assert!(after.rotated);
        assert_eq!(after.bytes, b"second generation, now longer\n");
    }

    #[test]
    fn test_checkpoint_backs_off_pending_and_resume_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        append(&path, "settled\nopen block\n");

        let mut tailer = LogTailer::new(&path, StartMode::Beginning);
        chunk(tailer.poll().unwrap());
        let cursor = tailer.checkpoint(11).unwrap();
        assert_eq!(cursor.offset, 8);

        let mut resumed = LogTailer::resume(&path, StartMode::End, Some(cursor));
        assert_eq!(chunk(resumed.poll().unwrap()).bytes, b"open block\n");
    }

    #[test]
    fn test_rewind_returns_to_committed_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.log");
        append(&path, "one\n");

        let mut tailer = LogTailer::new(&path, StartMode::Beginning);
        chunk(tailer.poll().unwrap());
        let cursor = tailer.checkpoint(0).unwrap();
        tailer.commit(cursor);

        append(&path, "two\n");
        chunk(tailer.poll().unwrap());
        tailer.rewind();
        assert_eq!(tailer.read_offset(), Some(4));
        assert_eq!(chunk(tailer.poll().unwrap()).bytes, b"two\n");
    }
}
