//! Persisted tail positions, one row per source file.

use std::path::Path;

use rusqlite::{params, OptionalExtension};

use super::{with_retry, Pool, StoreError};
use crate::ingest::tailer::{Cursor, FileFingerprint};

#[derive(Clone)]
pub struct CursorStore {
    pool: Pool,
}

impl CursorStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn load(&self, path: &Path) -> Result<Option<Cursor>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT byte_offset, device, inode FROM cursors WHERE path = ?1",
                params![path.to_string_lossy().into_owned()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(offset, device, inode)| Cursor {
            path: path.to_path_buf(),
            offset: offset.max(0) as u64,
            fingerprint: FileFingerprint {
                device: device as u64,
                inode: inode as u64,
            },
        }))
    }

    pub fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        with_retry(|| {
            let conn = self.pool.get()?;
            conn.execute(
                "INSERT INTO cursors (path, byte_offset, device, inode, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(path) DO UPDATE SET
                    byte_offset = excluded.byte_offset,
                    device = excluded.device,
                    inode = excluded.inode,
                    updated_at = excluded.updated_at",
                params![
                    cursor.path.to_string_lossy().into_owned(),
                    cursor.offset as i64,
                    cursor.fingerprint.device as i64,
                    cursor.fingerprint.inode as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// Forget a file's position so the next start re-reads it from scratch.
    pub fn clear(&self, path: &Path) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM cursors WHERE path = ?1",
            params![path.to_string_lossy().into_owned()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use std::path::PathBuf;

    #[test]
    fn test_save_load_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(open_pool(&dir.path().join("c.db")).unwrap());
        let path = PathBuf::from("/var/log/plex-backup.log");
        assert!(store.load(&path).unwrap().is_none());

        let mut cursor = Cursor {
            path: path.clone(),
            offset: 4096,
            fingerprint: FileFingerprint {
                device: 2049,
                inode: 131_077,
            },
        };
        store.save(&cursor).unwrap();
        assert_eq!(store.load(&path).unwrap(), Some(cursor.clone()));

        cursor.offset = 8192;
        store.save(&cursor).unwrap();
        assert_eq!(store.load(&path).unwrap().unwrap().offset, 8192);

        store.clear(&path).unwrap();
        assert!(store.load(&path).unwrap().is_none());
    }
}
